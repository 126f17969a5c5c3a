mod common;
mod dispatcher_tests;
