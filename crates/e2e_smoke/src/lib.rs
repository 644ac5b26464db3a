//! Test-only crate; the suites live in `tests/smoke.rs` and run against a
//! live AMQP broker when `BOLT_TEST_AMQP_URL` is set.
