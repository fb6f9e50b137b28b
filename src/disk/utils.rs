use anyhow::{anyhow, bail, Result};

pub const MIB: u64 = 1024 * 1024;

/// Parse a size given as plain bytes, `0x` hex, or with a K/M/G suffix.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        bail!("size is empty");
    }
    if s.starts_with("0x") {
        return parse_u64_any(s);
    }

    let (value, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1024u64),
        b'm' | b'M' => (&s[..s.len() - 1], MIB),
        b'g' | b'G' => (&s[..s.len() - 1], 1024u64 * MIB),
        _ => (s, 1u64),
    };

    let num: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid size: {input}"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size overflows: {input}"))
}

pub fn parse_u64_any(input: &str) -> Result<u64> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map_err(|_| anyhow!("invalid hex: {input}"))
    } else {
        s.parse::<u64>().map_err(|_| anyhow!("invalid number: {input}"))
    }
}

/// Round `value` up to a multiple of `align`; `None` if that overflows.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    value.div_ceil(align).checked_mul(align)
}

pub fn format_mib(bytes: u64) -> String {
    if bytes.is_multiple_of(MIB) {
        format!("{}M", bytes / MIB)
    } else {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    }
}

/// Turn a structure name into something safe to use as a file name.
pub fn slug(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "structure".to_string()
    } else {
        trimmed.to_string()
    }
}
