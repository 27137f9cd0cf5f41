//! Fuzzy string similarity used to disambiguate candidate files.
//!
//! `partial_ratio` follows the fuzzywuzzy/rapidfuzz convention: the shorter
//! string is slid over every equal-length window of the longer one and the
//! best normalized edit similarity wins, scaled to 0-100.

/// Levenshtein edit distance between two strings.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Normalized similarity of two strings in 0-100.
pub fn ratio(a: &str, b: &str) -> u32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 100;
    }
    let distance = levenshtein(a, b);
    (100.0 * (1.0 - distance as f64 / longest as f64)).round() as u32
}

/// Best similarity of the shorter string against any equal-length window of
/// the longer string, in 0-100. Comparison is case-insensitive.
pub fn partial_ratio(a: &str, b: &str) -> u32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a.as_str(), b.as_str())
    } else {
        (b.as_str(), a.as_str())
    };

    let short_len = shorter.chars().count();
    if short_len == 0 {
        return 100;
    }

    let longer_chars: Vec<char> = longer.chars().collect();
    let mut best = 0;
    for start in 0..=(longer_chars.len() - short_len) {
        let window: String = longer_chars[start..start + short_len].iter().collect();
        best = best.max(ratio(shorter, &window));
        if best == 100 {
            break;
        }
    }
    best
}
