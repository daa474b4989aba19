mod courses;
mod env;
pub mod utils;

pub use utils::test_utils;
