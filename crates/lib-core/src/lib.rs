pub mod errors;
pub mod fnc;
pub mod lexical;
pub mod sanitize;
