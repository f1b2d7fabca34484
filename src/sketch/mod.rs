pub mod constraints;
pub mod diagnostics;
pub mod residual;
pub mod solver;
pub mod types;
pub mod variables;

#[cfg(test)]
mod tests_residual;
#[cfg(test)]
mod tests_staged;
