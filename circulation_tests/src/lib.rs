//! End-to-end tests against a running `circulation_service`.
//!
//! Start the service with `CIRCULATION_DATABASE__USE_IN_MEMORY=true` (or a
//! postgres behind it) on port 8080, then run with `--features system_tests`
//! or `--features load_tests`.


#[cfg(all(test, feature = "load_tests"))]
mod load_test;
