// tests/property/main.rs

mod retry;
mod sequence;
