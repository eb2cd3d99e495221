//! Shared utility functions

/// Retry a fallible operation up to `retries` additional times.
///
/// The first `Ok` short-circuits; the error of the final attempt is returned
/// when every attempt fails.
pub fn retry<T, E>(retries: u32, mut f: impl FnMut() -> Result<T, E>) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt >= retries {
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}
