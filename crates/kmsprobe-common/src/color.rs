/// Parses `#RRGGBB`, `#AARRGGBB` or the short `#RGB` form into a packed
/// ARGB word. The alpha byte is 0xFF unless given explicitly.
pub fn parse_color(s: &str) -> Option<u32> {
    let s = s.trim().trim_start_matches('#');
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match s.len() {
        3 => {
            let mut rgb = 0u32;
            for c in s.chars() {
                let v = c.to_digit(16)?;
                rgb = (rgb << 8) | (v << 4 | v);
            }
            Some(0xFF000000 | rgb)
        }
        6 => u32::from_str_radix(s, 16).ok().map(|rgb| 0xFF000000 | rgb),
        8 => u32::from_str_radix(s, 16).ok(),
        _ => None,
    }
}
