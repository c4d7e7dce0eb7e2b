//! End-to-end tests for service-common live under `tests/`.
