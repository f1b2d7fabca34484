pub mod id;
pub mod sketch;

pub fn version() -> &'static str {
    "0.1.0"
}
