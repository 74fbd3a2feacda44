use core::{
    fmt::{self, Display},
    ops::{BitAnd, BitOr, BitOrAssign},
    str::FromStr,
};

/// Page protection bitset, bit-compatible with the kernel's `vm_prot_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(i32);

impl Protection {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);
    pub const DEFAULT: Self = Self(Self::READ.0 | Self::WRITE.0);
    pub const ALL: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXECUTE.0);

    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn is_exec(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Protection {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAnd for Protection {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.is_read() { 'r' } else { '-' };
        let w = if self.is_write() { 'w' } else { '-' };
        let x = if self.is_exec() { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

impl FromStr for Protection {
    type Err = String;

    /// Accepts `rwx`-style letters (`-` allowed as a placeholder) or an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty protection".into());
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return i32::from_str_radix(hex, 16).map(Self).map_err(|e| e.to_string());
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse().map(Self).map_err(|e: core::num::ParseIntError| e.to_string());
        }
        s.chars().try_fold(Self::NONE, |prot, c| match c {
            'r' | 'R' => Ok(prot | Self::READ),
            'w' | 'W' => Ok(prot | Self::WRITE),
            'x' | 'X' => Ok(prot | Self::EXECUTE),
            '-' => Ok(prot),
            _ => Err(format!("invalid protection: {s}")),
        })
    }
}

#[test]
fn test_protection_bits() {
    assert_eq!(Protection::NONE.bits(), 0);
    assert_eq!(Protection::READ.bits(), 1);
    assert_eq!(Protection::WRITE.bits(), 2);
    assert_eq!(Protection::EXECUTE.bits(), 4);
    assert_eq!(Protection::DEFAULT.bits(), 3);
    assert_eq!(Protection::ALL.bits(), 7);
    assert!(Protection::ALL.contains(Protection::DEFAULT));
    assert!(!Protection::DEFAULT.contains(Protection::EXECUTE));
}

#[test]
fn test_protection_parse() {
    assert_eq!("r-x".parse(), Ok(Protection::READ | Protection::EXECUTE));
    assert_eq!("rw".parse(), Ok(Protection::DEFAULT));
    assert_eq!("7".parse(), Ok(Protection::ALL));
    assert_eq!("0x1".parse(), Ok(Protection::READ));
    assert_eq!("0X7".parse(), Ok(Protection::ALL));
    assert_eq!("---".parse(), Ok(Protection::NONE));
    assert!("rwz".parse::<Protection>().is_err());
    assert!("".parse::<Protection>().is_err());
    assert_eq!(Protection::from_bits(5).to_string(), "r-x");
}
