mod common;
mod fingerprint_tests;
mod merge_tests;
