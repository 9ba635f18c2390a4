#[cfg(test)]
mod devices_tests;
