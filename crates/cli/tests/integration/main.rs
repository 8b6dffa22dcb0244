mod common;

mod approval_tests;
mod lock_tests;
mod pipeline_tests;
