pub mod openai;
pub mod r2r;
