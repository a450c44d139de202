use rand::Rng;

/// The rendezvous code alphabet.
///
/// 31 symbols: lowercase a-z without `i`, `l`, `o`, plus the digits 2-9.
/// Characters that read ambiguously in common fonts (`0`/`o`, `1`/`l`/`i`)
/// are excluded so a code can be relayed over voice or handwriting.
pub const ALPHABET: &[u8; 31] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// Generate a fresh rendezvous code in canonical `sss-sss-sss` form.
///
/// Nine symbols over a 31-character alphabet give roughly 44 bits of
/// entropy. The thread rng is a CSPRNG, which keeps codes unguessable
/// rather than merely unique.
///
/// # Example
///
/// ```
/// use signaling_server::code;
///
/// let generated = code::generate();
///
/// assert_eq!(generated.len(), 11);
/// assert!(code::validate(&generated));
/// assert!(!generated.contains(['0', '1', 'i', 'l', 'o']));
/// ```
pub fn generate() -> String {
    let mut rng = rand::rng();

    let mut out = String::with_capacity(11);
    for i in 0..9 {
        if i > 0 && i % 3 == 0 {
            out.push('-');
        }

        out.push(ALPHABET[rng.random_range(0..ALPHABET.len())] as char);
    }

    out
}

/// Normalize user input towards the canonical code form.
///
/// Lowercases, collapses runs of ASCII whitespace to a single hyphen and
/// trims leading/trailing hyphens and whitespace. No substitution of
/// confusable glyphs is attempted: the candidates (`0`, `1`, `i`, `l`, `o`)
/// map to characters outside the alphabet, so a substitution could never
/// turn a failed lookup into a successful one.
///
/// # Example
///
/// ```
/// use signaling_server::code::normalize;
///
/// assert_eq!(normalize("  ABC def\tghj "), "abc-def-ghj");
/// assert_eq!(normalize("abc-def-ghj"), "abc-def-ghj");
/// assert_eq!(normalize(&normalize("  X  Y  ")), normalize("  X  Y  "));
/// ```
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    let mut in_whitespace = false;
    for ch in input.trim().chars() {
        if ch.is_ascii_whitespace() {
            in_whitespace = true;
            continue;
        }

        if in_whitespace {
            out.push('-');
            in_whitespace = false;
        }

        out.push(ch.to_ascii_lowercase());
    }

    while out.starts_with('-') {
        out.remove(0);
    }

    while out.ends_with('-') {
        out.pop();
    }

    out
}

/// Check that the input normalizes to the `xxx-xxx-xxx` shape.
///
/// The check is shape-only over lowercase alphanumerics. It intentionally
/// accepts characters the mint never emits; a well-shaped code that was
/// never issued simply fails the room lookup.
///
/// # Example
///
/// ```
/// use signaling_server::code::validate;
///
/// assert!(validate("abc-def-ghj"));
/// assert!(validate("  ABC DEF GHJ  "));
/// assert!(validate("a1b-c2d-e3f"));
///
/// assert!(!validate("abc-def"));
/// assert!(!validate("abcd-efg-hjk"));
/// assert!(!validate("abc_def_ghj"));
/// ```
pub fn validate(input: &str) -> bool {
    let code = normalize(input);
    let bytes = code.as_bytes();

    if bytes.len() != 11 {
        return false;
    }

    bytes.iter().enumerate().all(|(i, byte)| match i {
        3 | 7 => *byte == b'-',
        _ => byte.is_ascii_lowercase() || byte.is_ascii_digit(),
    })
}
