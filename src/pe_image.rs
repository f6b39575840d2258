use std::fmt;
use std::fs;
use std::path::Path;

use object::pe::{ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile};
use object::{FileKind, Object};

use crate::error::{Error, Result};
use crate::os_info::Arch;

/// PDB signature GUID, kept in the byte order it has inside the RSDS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn data1(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn data2(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    pub fn data3(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    pub fn data4(&self) -> &[u8] {
        &self.0[8..]
    }
}

// symbol server form, no dashes or braces
impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08X}{:04X}{:04X}", self.data1(), self.data2(), self.data3())?;
        for b in self.data4() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// What we need to know about a module to fetch its PDB and name its INI section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub name: String,
    pub arch: Arch,
    pub entry_point: u32,
    pub pdb_name: String,
    pub guid: Guid,
    pub age: u32,
}

impl ModuleImage {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::parse(&name, &data)
    }

    pub fn parse(name: &str, data: &[u8]) -> Result<Self> {
        match FileKind::parse(data) {
            Ok(FileKind::Pe32) => parse_pe::<ImageNtHeaders32>(name, data),
            Ok(FileKind::Pe64) => parse_pe::<ImageNtHeaders64>(name, data),
            _ => Err(Error::InvalidImage(name.to_string())),
        }
    }

    /// Directory component of the symbol store path: GUID followed by age.
    pub fn symbol_key(&self) -> String {
        format!("{}{:X}", self.guid, self.age)
    }
}

fn parse_pe<Pe: ImageNtHeaders>(name: &str, data: &[u8]) -> Result<ModuleImage> {
    let pe = PeFile::<Pe>::parse(data).map_err(|_| Error::InvalidImage(name.to_string()))?;
    let arch = Arch::from_machine(pe.architecture())?;
    let entry_point = pe.nt_headers().optional_header().address_of_entry_point();

    let codeview = pe
        .pdb_info()?
        .ok_or_else(|| Error::NoDebugInfo(name.to_string()))?;

    // the record may carry the full build path of the PDB
    let pdb_path = String::from_utf8_lossy(codeview.path()).into_owned();
    let pdb_name = pdb_path
        .rsplit(|c: char| c == '\\' || c == '/')
        .next()
        .unwrap_or(&pdb_path)
        .to_string();
    if pdb_name.is_empty() {
        return Err(Error::NoDebugInfo(name.to_string()));
    }

    Ok(ModuleImage {
        name: name.to_string(),
        arch,
        entry_point,
        pdb_name,
        guid: Guid(codeview.guid()),
        age: codeview.age(),
    })
}
