pub mod check;
pub mod plan;
pub mod profiles;
pub mod run;
pub mod scan;
