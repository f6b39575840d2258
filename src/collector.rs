use std::path::Path;

use log::{debug, error};
use serde_json::{json, Value};

use crate::error::Result;
use crate::ini::IniFile;
use crate::os_info::{ini_section, OsInfo};
use crate::pdb_store::PdbStore;
use crate::pe_image::ModuleImage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub rva: Option<u32>,
    pub va: Option<u64>,
}

impl Resolution {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "rva": self.rva.map(|rva| format!("0x{:X}", rva)),
            "va": self.va.map(|va| format!("0x{:X}", va)),
        })
    }
}

/// Ties the OS identity, the module and its symbols together.
pub struct Collector {
    pub os: OsInfo,
    pub os_id: String,
    pub image: ModuleImage,
    pub module_base: Option<u64>,
    pub store: PdbStore,
}

impl Collector {
    pub fn new(os: OsInfo, image: ModuleImage, module_base: Option<u64>, store: PdbStore) -> Self {
        let os_id = os.os_id(image.arch);
        Collector {
            os,
            os_id,
            image,
            module_base,
            store,
        }
    }

    /// Replace the generated identifier, e.g. when collecting for another machine.
    pub fn with_os_id(mut self, os_id: &str) -> Self {
        self.os_id = os_id.to_string();
        self
    }

    pub fn section(&self) -> String {
        ini_section(&self.os_id, self.image.entry_point)
    }

    /// Look up every name; a missing symbol is reported and skipped.
    pub fn resolve(&self, names: &[&str]) -> Vec<Resolution> {
        names
            .iter()
            .map(|&name| match self.store.get_rva_r(name) {
                Ok(rva) => {
                    debug!("{} -> RVA 0x{:X}", name, rva);
                    Resolution {
                        name: name.to_string(),
                        rva: Some(rva),
                        va: self.module_base.map(|base| base + rva as u64),
                    }
                }
                Err(e) => {
                    error!("Failed to get symbol info for {}: {}", name, e);
                    Resolution {
                        name: name.to_string(),
                        rva: None,
                        va: None,
                    }
                }
            })
            .collect()
    }

    /// Machine-readable form of a run: identity of the section, the module
    /// base when it is loaded in this process, and every lookup.
    pub fn report_json(&self, resolutions: &[Resolution]) -> Value {
        json!({
            "os_id": self.os_id,
            "section": self.section(),
            "base": self.module_base.map(|base| format!("0x{:X}", base)),
            "symbols": resolutions.iter().map(Resolution::to_json).collect::<Vec<_>>(),
        })
    }

    /// Write `NAME=%08X` for every resolved symbol under this collector's
    /// section and return how many keys were written.
    pub fn persist(&self, path: &Path, resolutions: &[Resolution]) -> Result<usize> {
        let section = self.section();
        let mut ini = IniFile::load(path)?;
        let mut written = 0;
        for r in resolutions {
            if let Some(rva) = r.rva {
                ini.set(&section, &r.name, &format!("{:08X}", rva));
                written += 1;
            }
        }
        if written > 0 {
            ini.save(path)?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::os_info::Arch;
    use crate::pe_image::Guid;

    fn collector(base: Option<u64>) -> Collector {
        let os = OsInfo {
            major: 10,
            minor: 0,
            sp_major: 0,
            sp_minor: 0,
            product_type: 1,
            processor_architecture: 9,
        };
        let image = ModuleImage {
            name: "user32.dll".to_string(),
            arch: Arch::X64,
            entry_point: 0x1a2b0,
            pdb_name: "user32.pdb".to_string(),
            guid: Guid([0; 16]),
            age: 1,
        };
        let mut symbols = HashMap::new();
        symbols.insert("NtUserQueryWindow".to_string(), 0x1c2d0);
        symbols.insert("NtUserGetClassName".to_string(), 0x3f00);
        Collector::new(os, image, base, PdbStore::from_symbols(symbols))
    }

    #[test]
    fn section_name() {
        assert_eq!(collector(None).section(), "0A0000000109_x64_1A2B0");
        assert_eq!(
            collector(None).with_os_id("custom").section(),
            "custom_1A2B0"
        );
    }

    #[test]
    fn missing_symbols_are_skipped() {
        let c = collector(Some(0x7ff8_0000_0000));
        let res = c.resolve(&["NtUserQueryWindow", "NtUserBuildHwndList"]);
        assert_eq!(res[0].rva, Some(0x1c2d0));
        assert_eq!(res[0].va, Some(0x7ff8_0001_c2d0));
        assert_eq!(res[1].name, "NtUserBuildHwndList");
        assert_eq!(res[1].rva, None);
    }

    #[test]
    fn persist_writes_padded_rvas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NtApiCollection.ini");
        let c = collector(None);
        let res = c.resolve(&["NtUserGetClassName", "Missing", "NtUserQueryWindow"]);
        assert_eq!(c.persist(&path, &res).unwrap(), 2);

        let ini = IniFile::load(&path).unwrap();
        assert_eq!(ini.get("0A0000000109_x64_1A2B0", "NtUserGetClassName"), Some("00003F00"));
        assert_eq!(ini.get("0A0000000109_x64_1A2B0", "NtUserQueryWindow"), Some("0001C2D0"));
        assert_eq!(ini.get("0A0000000109_x64_1A2B0", "Missing"), None);
    }

    #[test]
    fn nothing_resolved_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NtApiCollection.ini");
        let c = collector(None);
        let res = c.resolve(&["Missing"]);
        assert_eq!(c.persist(&path, &res).unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn json_shape() {
        let r = Resolution {
            name: "NtUserQueryWindow".to_string(),
            rva: Some(0x10),
            va: None,
        };
        assert_eq!(
            r.to_json(),
            json!({"name": "NtUserQueryWindow", "rva": "0x10", "va": null})
        );
    }

    #[test]
    fn report_carries_base_and_section() {
        let c = collector(Some(0x7ff8_0000_0000));
        let res = c.resolve(&["NtUserGetClassName"]);
        assert_eq!(
            c.report_json(&res),
            json!({
                "os_id": "0A0000000109_x64",
                "section": "0A0000000109_x64_1A2B0",
                "base": "0x7FF800000000",
                "symbols": [{"name": "NtUserGetClassName", "rva": "0x3F00", "va": "0x7FF800003F00"}],
            })
        );
        assert_eq!(collector(None).report_json(&[])["base"], Value::Null);
    }
}
