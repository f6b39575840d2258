use std::fmt;

use object::Architecture;

use crate::error::{Error, Result};

/// Version fields that make up the OS identifier. Field widths follow
/// `OSVERSIONINFOEXW` and `SYSTEM_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OsInfo {
    pub major: u32,
    pub minor: u32,
    pub sp_major: u16,
    pub sp_minor: u16,
    pub product_type: u8,
    pub processor_architecture: u16,
}

impl OsInfo {
    pub fn os_id(&self, arch: Arch) -> String {
        format!(
            "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}_{}",
            self.major,
            self.minor,
            self.sp_major,
            self.sp_minor,
            self.product_type,
            self.processor_architecture,
            arch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn from_machine(machine: Architecture) -> Result<Self> {
        match machine {
            Architecture::I386 => Ok(Arch::X86),
            Architecture::X86_64 => Ok(Arch::X64),
            other => Err(Error::UnsupportedArchitecture(other)),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arch::X86 => write!(f, "x86"),
            Arch::X64 => write!(f, "x64"),
        }
    }
}

/// Section name used in the INI: OS identifier plus the module entry point,
/// which changes whenever the module is rebuilt.
pub fn ini_section(os_id: &str, entry_point: u32) -> String {
    format!("{}_{:X}", os_id, entry_point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows10_x64_identifier() {
        let os = OsInfo {
            major: 10,
            minor: 0,
            sp_major: 0,
            sp_minor: 0,
            product_type: 1,
            processor_architecture: 9,
        };
        assert_eq!(os.os_id(Arch::X64), "0A0000000109_x64");
    }

    #[test]
    fn windows7_sp1_wow64_identifier() {
        let os = OsInfo {
            major: 6,
            minor: 1,
            sp_major: 1,
            sp_minor: 0,
            product_type: 1,
            processor_architecture: 9,
        };
        assert_eq!(os.os_id(Arch::X86), "060101000109_x86");
    }

    #[test]
    fn section_uses_unpadded_entry_point() {
        assert_eq!(ini_section("0A0000000109_x64", 0x1a2b0), "0A0000000109_x64_1A2B0");
        assert_eq!(ini_section("id", 0), "id_0");
    }

    #[test]
    fn arch_from_machine() {
        assert_eq!(Arch::from_machine(Architecture::X86_64).unwrap(), Arch::X64);
        assert_eq!(Arch::from_machine(Architecture::I386).unwrap(), Arch::X86);
        assert!(Arch::from_machine(Architecture::Aarch64).is_err());
    }
}
