//! Built-in task handlers: local persistence and HTTP delivery
//!
//! Both handlers run on the worker thread, so blocking I/O is fine here. Any
//! error bubbles back into the worker, which records the failure and lets the
//! retry / dead letter policy take over.

use crate::config::Config;
use crate::queue::{with_connection, Message};
use crate::worker::Registry;
use anyhow::{Context, Result};
use rusqlite::named_params;
use std::time::Duration;

/// Timeout for one delivery attempt against the remote endpoint
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const CREATE_MEASUREMENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS measurements(
        timestamp INT PRIMARY KEY,
        sensor_id INT NOT NULL,
        last_measurement_period INT,
        time_since_report INT,
        optical_range NUMERIC,
        precipitation_type_msg TEXT,
        obstruction_to_vision TEXT,
        receiver_bg_illumination NUMERIC,
        water_in_precip NUMERIC,
        temp NUMERIC,
        nr_precip_particles INT,
        transmission_eq NUMERIC,
        exco_less_precip_particle NUMERIC,
        backscatter_exco NUMERIC,
        self_test VARCHAR(3),
        total_exco NUMERIC
    )
"#;

/// The registry the daemon runs with: both built-in handlers under the names
/// persisted in the task column
pub fn builtin_registry() -> Registry {
    Registry::builder()
        .register("save_locally", save_locally)
        .register("post_data", post_data)
        .build()
}

/// Insert the measurement into the local measurements table
pub fn save_locally(msg: &Message, cfg: &Config) -> Result<()> {
    let m = &msg.blob;
    with_connection(&cfg.local_db, |tx| {
        tx.execute_batch(CREATE_MEASUREMENTS_TABLE)?;
        tx.execute(
            "INSERT INTO measurements(
                timestamp,
                sensor_id,
                last_measurement_period,
                time_since_report,
                optical_range,
                precipitation_type_msg,
                obstruction_to_vision,
                receiver_bg_illumination,
                water_in_precip,
                temp,
                nr_precip_particles,
                transmission_eq,
                exco_less_precip_particle,
                backscatter_exco,
                self_test,
                total_exco
            )
            VALUES (
                :timestamp,
                :sensor_id,
                :last_measurement_period,
                :time_since_report,
                :optical_range,
                :precipitation_type_msg,
                :obstruction_to_vision,
                :receiver_bg_illumination,
                :water_in_precip,
                :temp,
                :nr_precip_particles,
                :transmission_eq,
                :exco_less_precip_particle,
                :backscatter_exco,
                :self_test,
                :total_exco
            )",
            named_params! {
                ":timestamp": m.timestamp,
                ":sensor_id": m.sensor_id,
                ":last_measurement_period": m.last_measurement_period,
                ":time_since_report": m.time_since_report,
                ":optical_range": m.optical_range,
                ":precipitation_type_msg": m.precipitation_type_msg.code(),
                ":obstruction_to_vision": m.obstruction_to_vision.code(),
                ":receiver_bg_illumination": m.receiver_bg_illumination,
                ":water_in_precip": m.water_in_precip,
                ":temp": m.temp,
                ":nr_precip_particles": m.nr_precip_particles,
                ":transmission_eq": m.transmission_eq,
                ":exco_less_precip_particle": m.exco_less_precip_particle,
                ":backscatter_exco": m.backscatter_exco,
                ":self_test": m.self_test,
                ":total_exco": m.total_exco,
            },
        )?;
        Ok(())
    })
    .with_context(|| format!("failed to save measurement {} locally", m.timestamp))
}

/// POST the measurement JSON to the configured endpoint.
///
/// A non-2xx response is an error, which routes the message through the
/// retry / dead letter path.
pub fn post_data(msg: &Message, cfg: &Config) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")?;
    client
        .post(&cfg.endpoint)
        .header(reqwest::header::AUTHORIZATION, cfg.api_key.as_str())
        .json(&msg.blob)
        .send()
        .with_context(|| format!("failed to POST measurement to {}", cfg.endpoint))?
        .error_for_status()
        .context("endpoint rejected measurement")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::measurement::{test_measurement, Measurement};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_save_locally_inserts_row() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            local_db: dir.path().join("local.db"),
            ..test_config()
        };
        let msg = Message::new("save_locally", test_measurement());
        save_locally(&msg, &cfg).unwrap();

        let row: (i64, u16, String, String, f64) = with_connection(&cfg.local_db, |tx| {
            Ok(tx.query_row(
                "SELECT timestamp, sensor_id, precipitation_type_msg,
                        obstruction_to_vision, total_exco
                 FROM measurements",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?)
        })
        .unwrap();
        assert_eq!(row, (1658758977000, 1, "NP".into(), "HZ".into(), 2.51));
    }

    #[test]
    fn test_save_locally_duplicate_timestamp_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            local_db: dir.path().join("local.db"),
            ..test_config()
        };
        let msg = Message::new("save_locally", test_measurement());
        save_locally(&msg, &cfg).unwrap();
        // timestamp is the primary key
        assert!(save_locally(&msg, &cfg).is_err());
    }

    /// One-shot HTTP responder: accepts a single request, captures it, and
    /// answers with the given status line
    fn one_shot_server(status_line: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            // read headers, then the Content-Length body
            let body_start = loop {
                let n = stream.read(&mut buf).unwrap();
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&raw[..body_start]).to_string();
            let content_length: usize = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(str::to_string))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            while raw.len() < body_start + content_length {
                let n = stream.read(&mut buf).unwrap();
                raw.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(format!("{status_line}\r\nContent-Length: 0\r\n\r\n").as_bytes())
                .unwrap();
            tx.send(String::from_utf8_lossy(&raw).to_string()).unwrap();
        });
        (format!("http://{addr}/"), rx)
    }

    #[test]
    fn test_post_data_sends_measurement_json() {
        let (endpoint, rx) = one_shot_server("HTTP/1.1 200 OK");
        let cfg = Config {
            endpoint,
            ..test_config()
        };
        let msg = Message::new("post_data", test_measurement());
        post_data(&msg, &cfg).unwrap();

        let request = rx.recv().unwrap();
        assert!(request.starts_with("POST / HTTP/1.1\r\n"), "{request}");
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: deadbeef"), "{request}");
        assert!(lower.contains("content-type: application/json"), "{request}");
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let sent: Measurement = serde_json::from_str(body).unwrap();
        assert_eq!(sent, msg.blob);
    }

    #[test]
    fn test_post_data_non_2xx_is_an_error() {
        let (endpoint, _rx) = one_shot_server("HTTP/1.1 503 Service Unavailable");
        let cfg = Config {
            endpoint,
            ..test_config()
        };
        let msg = Message::new("post_data", test_measurement());
        let err = post_data(&msg, &cfg).unwrap_err();
        assert!(err.to_string().contains("endpoint rejected measurement"));
    }

    #[test]
    fn test_builtin_registry_names() {
        let registry = builtin_registry();
        assert!(registry.get("save_locally").is_some());
        assert!(registry.get("post_data").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
