mod common;

mod approval_tests;
mod deploy_tests;
mod lock_tests;
mod release_tests;
mod stale_plan_tests;
