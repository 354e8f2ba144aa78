//! Generalized FizzBuzz sequence generator.
//!
//! Pure and stateless. Inputs are assumed validated by the HTTP layer:
//! both divisors and `limit` are positive and the labels are non-empty.

/// Returns the labels for `1..=limit`.
///
/// Position `i` is `str1` when `i` is a multiple of `int1`, followed by `str2`
/// when it is a multiple of `int2`; positions matching neither are the
/// decimal form of `i`.
pub fn generate(int1: u64, int2: u64, limit: u64, str1: &str, str2: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(usize::try_from(limit).unwrap_or(0));

    for i in 1..=limit {
        let mut label = String::new();
        if i % int1 == 0 {
            label.push_str(str1);
        }
        if i % int2 == 0 {
            label.push_str(str2);
        }
        if label.is_empty() {
            label = i.to_string();
        }
        out.push(label);
    }

    out
}
