use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::{debug, info};
use pdb::{FallibleIterator, Rva, SymbolData, PDB};

use crate::error::{Error, Result};
use crate::os_info::Arch;
use crate::pe_image::ModuleImage;

type SymbolStore = HashMap<String, u32>;

/// Public symbols of one PDB, keyed by undecorated name.
pub struct PdbStore {
    pub symbols: SymbolStore,
}

/// GUID fields and age a PDB records about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdbSignature {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
    pub age: u32,
}

impl PdbSignature {
    pub fn matches(&self, image: &ModuleImage) -> bool {
        self.data1 == image.guid.data1()
            && self.data2 == image.guid.data2()
            && self.data3 == image.guid.data3()
            && &self.data4[..] == image.guid.data4()
            && self.age == image.age
    }

    /// Same layout as `ModuleImage::symbol_key`.
    pub fn key(&self) -> String {
        format!(
            "{:08X}{:04X}{:04X}{}{:X}",
            self.data1,
            self.data2,
            self.data3,
            hex(&self.data4),
            self.age
        )
    }

    pub fn check(&self, path: &Path, image: &ModuleImage) -> Result<()> {
        if self.matches(image) {
            Ok(())
        } else {
            Err(Error::PdbMismatch {
                path: path.to_path_buf(),
                want: image.symbol_key(),
                found: self.key(),
            })
        }
    }
}

fn open_pdb(path: &Path) -> Result<(PDB<'static, File>, PdbSignature)> {
    let mut pdb = PDB::open(File::open(path)?)?;

    let info = pdb.pdb_information()?;
    let dbi = pdb.debug_information()?;
    let age = dbi.age().unwrap_or(info.age);
    debug!("PDB {:?}, guid: {}, age: {}", path, info.guid, age);

    let (data1, data2, data3, data4) = info.guid.as_fields();
    let signature = PdbSignature {
        data1,
        data2,
        data3,
        data4: *data4,
        age,
    };
    Ok((pdb, signature))
}

/// Whether `path` is a readable PDB built together with `image`. Anything
/// unreadable counts as a mismatch.
pub fn matches_image(path: &Path, image: &ModuleImage) -> bool {
    match open_pdb(path) {
        Ok((_, signature)) if signature.matches(image) => true,
        Ok((_, signature)) => {
            debug!("Skipping {:?}: signature {} != {}", path, signature.key(), image.symbol_key());
            false
        }
        Err(e) => {
            debug!("Skipping {:?}: {}", path, e);
            false
        }
    }
}

/// Build the name table from `(raw name, rva)` public records. Records
/// without an RVA are dropped and the first record of a name wins, as with
/// SymFromName.
fn collect_public<I>(records: I, arch: Arch) -> SymbolStore
where
    I: IntoIterator<Item = (String, Option<u32>)>,
{
    let mut symbol_extracted: SymbolStore = HashMap::new();
    for (raw, rva) in records {
        let rva = match rva {
            Some(rva) => rva,
            None => continue,
        };
        let name = match arch {
            Arch::X86 => undecorate(&raw).to_string(),
            Arch::X64 => raw,
        };
        symbol_extracted.entry(name).or_insert(rva);
    }
    symbol_extracted
}

impl PdbStore {
    pub fn from_symbols(symbols: SymbolStore) -> Self {
        PdbStore { symbols }
    }

    /// Parse `path`, refusing a PDB that was not built together with `image`.
    pub fn open(path: &Path, image: &ModuleImage) -> Result<Self> {
        let (mut pdb, signature) = open_pdb(path)?;
        info!("PDB {:?}, signature {}", path, signature.key());
        signature.check(path, image)?;

        let addr_map = pdb.address_map()?;
        let glosym = pdb.global_symbols()?;
        let mut records = Vec::new();
        let mut symbols = glosym.iter();
        while let Some(symbol) = symbols.next()? {
            if let Ok(SymbolData::Public(data)) = symbol.parse() {
                let rva = data.offset.to_rva(&addr_map).map(|Rva(rva)| rva);
                records.push((data.name.to_string().into_owned(), rva));
            }
        }

        let symbol_extracted = collect_public(records, image.arch);
        debug!("{} public symbols in {:?}", symbol_extracted.len(), path);

        Ok(PdbStore {
            symbols: symbol_extracted,
        })
    }

    pub fn get_rva(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    pub fn get_rva_r(&self, name: &str) -> Result<u32> {
        self.get_rva(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Strip the x86 C decorations: `_Name`, `_Name@N` (stdcall) and `@Name@N`
/// (fastcall). C++ names are returned unchanged.
pub fn undecorate(name: &str) -> &str {
    if name.starts_with('?') {
        return name;
    }
    let stripped = match name.strip_prefix('_').or_else(|| name.strip_prefix('@')) {
        Some(s) => s,
        None => return name,
    };
    match stripped.rfind('@') {
        Some(at)
            if at > 0
                && at + 1 < stripped.len()
                && stripped[at + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &stripped[..at]
        }
        _ if name.starts_with('@') => name,
        _ => stripped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe_image::Guid;

    fn image(arch: Arch) -> ModuleImage {
        ModuleImage {
            name: "user32.dll".to_string(),
            arch,
            entry_point: 0x1000,
            pdb_name: "user32.pdb".to_string(),
            guid: Guid([
                0x78, 0x56, 0x34, 0x12, 0xbc, 0x9a, 0xf0, 0xde,
                0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
            ]),
            age: 3,
        }
    }

    fn signature() -> PdbSignature {
        PdbSignature {
            data1: 0x1234_5678,
            data2: 0x9abc,
            data3: 0xdef0,
            data4: [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
            age: 3,
        }
    }

    #[test]
    fn signature_matches_image() {
        let img = image(Arch::X64);
        let sig = signature();
        assert!(sig.matches(&img));
        assert_eq!(sig.key(), img.symbol_key());
        assert!(sig.check(Path::new("user32.pdb"), &img).is_ok());
    }

    #[test]
    fn guid_mismatch_is_fatal() {
        let img = image(Arch::X64);
        let mut sig = signature();
        sig.data4[7] = 0xee;
        match sig.check(Path::new("user32.pdb"), &img) {
            Err(Error::PdbMismatch { want, found, .. }) => {
                assert_eq!(want, "123456789ABCDEF00123456789ABCDEF3");
                assert_eq!(found, "123456789ABCDEF00123456789ABCDEE3");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn age_mismatch_is_fatal() {
        let img = image(Arch::X64);
        let sig = PdbSignature { age: 4, ..signature() };
        assert!(!sig.matches(&img));
        match sig.check(Path::new("user32.pdb"), &img) {
            Err(Error::PdbMismatch { found, .. }) => assert!(found.ends_with("EF4")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn first_public_record_wins() {
        let records = vec![
            ("NtUserQueryWindow".to_string(), Some(0x1c2d0)),
            ("NtUserQueryWindow".to_string(), Some(0x9999)),
            ("NtUserBuildHwndList".to_string(), None),
            ("_x64Name".to_string(), Some(0x40)),
        ];
        let symbols = collect_public(records, Arch::X64);
        assert_eq!(symbols.get("NtUserQueryWindow"), Some(&0x1c2d0));
        assert_eq!(symbols.get("NtUserBuildHwndList"), None);
        assert_eq!(symbols.get("_x64Name"), Some(&0x40));
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn x86_records_are_undecorated() {
        let records = vec![
            ("_NtUserGetClassName@12".to_string(), Some(0x3f00)),
            ("_NtUserFindWindowEx@20".to_string(), Some(0x4100)),
            ("NtUserFindWindowEx".to_string(), Some(0x5000)),
        ];
        let store = PdbStore::from_symbols(collect_public(records, Arch::X86));
        assert_eq!(store.get_rva("NtUserGetClassName"), Some(0x3f00));
        assert_eq!(store.get_rva("NtUserFindWindowEx"), Some(0x4100));
        assert_eq!(store.get_rva("_NtUserGetClassName@12"), None);
    }

    #[test]
    fn unreadable_pdb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user32.pdb");
        std::fs::write(&path, b"not a multi-stream file").unwrap();

        assert!(!matches_image(&path, &image(Arch::X64)));
        assert!(!matches_image(&dir.path().join("missing.pdb"), &image(Arch::X64)));
        match PdbStore::open(&path, &image(Arch::X64)) {
            Err(Error::Pdb(_)) => {}
            other => panic!("unexpected {:?}", other.map(|s| s.symbols)),
        }
    }

    #[test]
    fn undecorate_x86_names() {
        assert_eq!(undecorate("_NtUserQueryWindow@8"), "NtUserQueryWindow");
        assert_eq!(undecorate("@NtUserFastCall@12"), "NtUserFastCall");
        assert_eq!(undecorate("_NtUserGetClassName"), "NtUserGetClassName");
        assert_eq!(undecorate("NtUserBuildHwndList"), "NtUserBuildHwndList");
        assert_eq!(undecorate("?Method@Class@@QAEXXZ"), "?Method@Class@@QAEXXZ");
        assert_eq!(undecorate("__imp__Foo@4"), "_imp__Foo");
        assert_eq!(undecorate("@weird"), "@weird");
    }

    #[test]
    fn lookup_by_name() {
        let mut symbols = HashMap::new();
        symbols.insert("NtUserFindWindowEx".to_string(), 0x2_1340);
        let store = PdbStore::from_symbols(symbols);

        assert_eq!(store.get_rva("NtUserFindWindowEx"), Some(0x2_1340));
        assert_eq!(store.get_rva("NtUserGetClassName"), None);
        match store.get_rva_r("NtUserGetClassName") {
            Err(Error::SymbolNotFound(name)) => assert_eq!(name, "NtUserGetClassName"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
