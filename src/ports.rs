use crate::error::{Result, ScanError};

/// An inclusive, validated TCP port range.
///
/// Sizing is O(1) and iteration is lazy; every call to [`PortRange::iter`] starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Validate `1 <= start <= end <= 65535`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start == 0 || end > 65535 || start > end {
            return Err(ScanError::InvalidPortRange { start, end });
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    /// Never true for a validated range; kept for the `len` convention.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

/// Parse `"80"` or `"8000-8010"` (whitespace tolerated) into a range.
pub fn parse_port_range(s: &str) -> Result<PortRange> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let start = parse_port_str(a.trim())?;
        let end = parse_port_str(b.trim())?;
        return PortRange::new(start, end);
    }
    let p = parse_port_str(s)?;
    PortRange::new(p, p)
}

fn parse_port_str(s: &str) -> Result<u32> {
    s.parse::<u32>().map_err(|_| ScanError::InvalidPort {
        input: s.to_string(),
    })
}
