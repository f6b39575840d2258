extern crate app_dirs;

pub mod collector;
pub mod error;
pub mod ini;
pub mod os_info;
pub mod pdb_store;
pub mod pe_image;
pub mod symsrv;
#[cfg(windows)]
pub mod windows;

use app_dirs::AppInfo;

pub const APP_INFO: AppInfo = AppInfo {
    name: "ntapi-collector",
    author: "nganhkhoa",
};

pub const USER32: &str = "user32.dll";
pub const INI_FILE_NAME: &str = "NtApiCollection.ini";

/// win32k system call stubs the injector hooks. They are not exported, so
/// their offsets come from the public PDB.
pub const FUNCTION_NAMES: [&str; 5] = [
    "NtUserQueryWindow",
    "NtUserBuildHwndList",
    "NtUserFindWindowEx",
    "NtUserInternalGetWindowText",
    "NtUserGetClassName",
];
