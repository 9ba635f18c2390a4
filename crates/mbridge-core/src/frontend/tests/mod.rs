#[cfg(test)]
mod console_tests;
