//! Helpers shared by the test suites of the quarry crates.

use rand::Rng;

pub use dotenvy;
pub use tempfile;

/// Environment variable holding the Postgres DSN used by integration tests.
pub const TEST_DSN_ENV: &str = "TEST_QUARRY_CATALOG_DSN";

/// Returns the Postgres DSN for integration tests, or returns early from the calling test.
///
/// Integration tests run when `TEST_INTEGRATION` is set; if it is set but the DSN variable is not,
/// the test panics instead of silently passing.
#[macro_export]
macro_rules! maybe_skip_integration {
    () => {{
        $crate::dotenvy::dotenv().ok();

        let force = std::env::var("TEST_INTEGRATION");
        match (std::env::var($crate::TEST_DSN_ENV), force) {
            (Ok(dsn), _) if !dsn.is_empty() => dsn,
            (_, Ok(_)) => panic!(
                "TEST_INTEGRATION is set, but variable {} needs to be set",
                $crate::TEST_DSN_ENV
            ),
            (_, Err(_)) => {
                eprintln!(
                    "skipping Postgres integration test - set {} and TEST_INTEGRATION to run",
                    $crate::TEST_DSN_ENV
                );
                return;
            }
        }
    }};
}

/// A random lower case schema name so concurrently running tests do not share tables.
pub fn random_schema_name() -> String {
    // use scope to make it clear to clippy / rust that `rng` is
    // not carried past await points
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(rand::distributions::Alphanumeric)
        .filter(|c| c.is_ascii_alphabetic())
        .take(20)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("test_{suffix}")
}

/// Writes an executable shell script into `dir` and returns its path.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::{io::Write, os::unix::fs::PermissionsExt};

    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create script");
    writeln!(file, "#!/bin/sh").expect("write script");
    file.write_all(body.as_bytes()).expect("write script");
    file.sync_all().expect("sync script");
    drop(file);

    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}
