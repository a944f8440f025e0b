use std::fmt::Display;

/// A size or rate argument like `750k` or `10M`, parsed with binary
/// suffixes down to a plain byte count. Rendering one back (for mbuffer's
/// `-r` flag) always prints the byte count, whatever spelling the user
/// chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bytes(u64);

impl Bytes {
    pub fn try_from_str(value: &str) -> Result<Self, String> {
        let digits_end = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, suffix) = value.split_at(digits_end);
        let base: u64 = digits
            .parse()
            .map_err(|_| format!("expected a size like 128k or 10M, got {value:?}"))?;
        let shift = match suffix {
            "" => 0u32,
            "k" | "K" => 10,
            "m" | "M" => 20,
            "g" | "G" => 30,
            "t" | "T" => 40,
            _ => return Err(format!("unknown size suffix {suffix:?} in {value:?}")),
        };
        if base == 0 {
            return Err(format!("size {value:?} must not be zero"));
        }
        let bytes = base
            .checked_mul(1u64 << shift)
            .ok_or_else(|| format!("size {value:?} is out of range"))?;
        Ok(Self(bytes))
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
