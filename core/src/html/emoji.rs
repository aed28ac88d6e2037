/// Unicode emoji decoding from Zulip's unified codepoint notation
///
/// `emoji-1f1fa-1f1f8` (or just `1f1fa-1f1f8`) decodes to the concatenated
/// codepoints. Any group that isn't valid hex, or isn't a valid scalar value,
/// makes the whole result empty.
pub fn unified_to_unicode(input: &str) -> String {
    let input = input.strip_prefix("emoji-").unwrap_or(input);
    let mut out = String::new();
    for part in input.split('-') {
        let Some(c) = u32::from_str_radix(part, 16).ok().and_then(char::from_u32) else {
            return String::new();
        };
        out.push(c);
    }
    out
}
