//! Human-readable formatting of addresses, sizes and ranges for log output.

use core::fmt::{self, Write};

use crate::MemoryRange;

/// Formats a physical address as uppercase hexadecimal with a `0x` prefix and
/// a `_` separator between every group of four digits.
///
/// ```
/// use bootmem::HumanAddress;
///
/// assert_eq!(format!("{}", HumanAddress(0x0)), "0x0");
/// assert_eq!(format!("{}", HumanAddress(0x1_0000_0000)), "0x1_0000_0000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanAddress(pub u64);

impl fmt::Display for HumanAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = (u64::BITS - self.0.leading_zeros()).max(1).div_ceil(4);

        f.write_str("0x")?;
        for position in (0..digits).rev() {
            let nibble = (self.0 >> (position * 4)) & 0xF;
            write!(f, "{:X}", nibble)?;
            if position != 0 && position % 4 == 0 {
                f.write_char('_')?;
            }
        }

        Ok(())
    }
}

/// Formats a byte count with binary prefixes (KiB, MiB, ...), truncated to at
/// most two decimal places with trailing zeros dropped.
///
/// ```
/// use bootmem::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(1023)), "1023B");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let bytes = self.0;
        let mut unit = 0;
        while unit + 1 < UNITS.len() && bytes >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }

        let shift = 10 * unit;
        let whole = bytes >> shift;
        let remainder = u128::from(bytes & ((1u64 << shift) - 1));
        let hundredths = (remainder * 100) >> shift;

        if hundredths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else if hundredths % 10 == 0 {
            write!(f, "{}.{}{}", whole, hundredths / 10, UNITS[unit])
        } else {
            write!(f, "{}.{:02}{}", whole, hundredths, UNITS[unit])
        }
    }
}

/// Formats a range as `first-last (size)` with an inclusive last byte, so a
/// range reaching the top of the address space prints without wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HumanRange(pub MemoryRange);

impl fmt::Display for HumanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = self.0;
        if range.length() == 0 {
            return write!(f, "{} (0B)", HumanAddress(range.base()));
        }

        write!(
            f,
            "{}-{} ({})",
            HumanAddress(range.base()),
            HumanAddress(range.limit()),
            HumanSize(range.length())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_zero() {
        assert_eq!(format!("{}", HumanAddress(0)), "0x0");
    }

    #[test]
    fn address_groups_digits_by_four() {
        assert_eq!(format!("{}", HumanAddress(0xFFF)), "0xFFF");
        assert_eq!(format!("{}", HumanAddress(0x1000)), "0x1000");
        assert_eq!(format!("{}", HumanAddress(0x1_2345)), "0x1_2345");
        assert_eq!(format!("{}", HumanAddress(0xFFFF_FFFF)), "0xFFFF_FFFF");
        assert_eq!(
            format!("{}", HumanAddress(u64::MAX)),
            "0xFFFF_FFFF_FFFF_FFFF"
        );
    }

    #[test]
    fn size_below_one_kibibyte() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(512)), "512B");
    }

    #[test]
    fn size_with_prefixes() {
        assert_eq!(format!("{}", HumanSize(0x1000)), "4KiB");
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(0x10_0000)), "1MiB");
        assert_eq!(format!("{}", HumanSize(0x1_0000_0000)), "4GiB");
        assert_eq!(format!("{}", HumanSize(1280)), "1.25KiB");
    }

    #[test]
    fn size_of_whole_address_space_minus_one_page() {
        assert_eq!(format!("{}", HumanSize(0u64.wrapping_sub(0x1000))), "15.99EiB");
    }

    #[test]
    fn range_prints_inclusive_limit() {
        let range = MemoryRange::new(0x1000, 0x1000);
        assert_eq!(format!("{}", HumanRange(range)), "0x1000-0x1FFF (4KiB)");
    }

    #[test]
    fn range_reaching_top_does_not_wrap() {
        let range = MemoryRange::new(0xFFFF_FFFF_FFFF_F000, 0x1000);
        assert_eq!(
            format!("{}", HumanRange(range)),
            "0xFFFF_FFFF_FFFF_F000-0xFFFF_FFFF_FFFF_FFFF (4KiB)"
        );
    }
}
