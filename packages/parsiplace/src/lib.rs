pub mod alignment;
pub mod alphabet;
pub mod io;
pub mod make_error;
pub mod mutation;
pub mod oracle;
pub mod params;
pub mod run;
pub mod search;
pub mod tree;
pub mod utils;
