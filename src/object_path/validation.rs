/// Validate an object path.
///
/// A valid path is `/` alone, or `/`-prefixed non-empty segments of
/// `[A-Za-z0-9_]` without a trailing slash.
pub(super) const fn validate(bytes: &[u8]) -> bool {
    match bytes {
        [] => false,
        [b'/'] => true,
        [b'/', rest @ ..] => {
            let mut after_slash = true;
            let mut i = 0;

            while i < rest.len() {
                match rest[i] {
                    b'/' if after_slash => return false,
                    b'/' => after_slash = true,
                    b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => after_slash = false,
                    _ => return false,
                }

                i += 1;
            }

            !after_slash
        }
        _ => false,
    }
}
