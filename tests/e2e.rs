//! End-to-end tests against a real container runtime
//!
//! These tests shell out to the `container` CLI (or whatever
//! `KINA_CONTAINER_CLI` names) and build real clusters. They are ignored by
//! default and can be run with:
//!
//! ```bash
//! cargo test --test e2e -- --ignored --nocapture
//! ```

mod e2e_tests;
