pub mod enums;
pub mod helpers;
pub mod math_functions;
