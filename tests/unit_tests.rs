//! Unit tests for individual components, mounted from `tests/unit/`.

mod unit;
