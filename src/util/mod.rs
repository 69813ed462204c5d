pub mod clock;
pub mod env;
pub mod telemetry;

/// Performs `&str` comparisons in constant time in an attempt to close any and all side-channels
/// that might leak information about our key
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (left, right) in a.bytes().zip(b.bytes()) {
        // black_box keeps the optimizer from short-circuiting the fold
        diff |= std::hint::black_box(left ^ right);
    }

    diff == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_const_time_cmp() {
        let expects = "test_string";
        let passing = "test_string";

        let bad_start = "__st_string";
        let bad_end = "test_str___";

        let short = "test_strin";
        let long = "test_string_";

        assert!(constant_time_cmp(expects, passing));
        assert!(!constant_time_cmp(expects, bad_start));
        assert!(!constant_time_cmp(expects, bad_end));
        assert!(!constant_time_cmp(expects, short));
        assert!(!constant_time_cmp(expects, long));
    }
}
