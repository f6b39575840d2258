use std::io;
use std::mem;
use std::path::PathBuf;

use widestring::{U16CString, U16String};

use winapi::shared::minwindef::HMODULE;
use winapi::shared::ntdef::{LPCSTR, NTSTATUS};
use winapi::um::libloaderapi::{GetModuleFileNameW, GetProcAddress, LoadLibraryA, LoadLibraryW};
use winapi::um::sysinfoapi::{GetNativeSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{OSVERSIONINFOEXW, PRTL_OSVERSIONINFOW};

use crate::error::{Error, Result};
use crate::os_info::OsInfo;

// long enough for \\?\ paths
const MODULE_PATH_CAPACITY: usize = 32 * 1024;

/// A module mapped into this process.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub base: u64,
    pub path: PathBuf,
}

fn last_error() -> String {
    io::Error::last_os_error().to_string()
}

/// Version data comes from `RtlGetVersion`, which is not subject to the
/// manifest-based version lie of `GetVersionEx` on 8.1 and later.
pub fn query_os_info() -> Result<OsInfo> {
    let mut version_info: OSVERSIONINFOEXW = unsafe { mem::zeroed() };
    version_info.dwOSVersionInfoSize = mem::size_of::<OSVERSIONINFOEXW>() as u32;

    let status: NTSTATUS = unsafe {
        let ntdll = LoadLibraryA(b"ntdll\0".as_ptr() as LPCSTR);
        if ntdll.is_null() {
            return Err(Error::OsInfo(last_error()));
        }
        let rtl_get_version_ = GetProcAddress(ntdll, b"RtlGetVersion\0".as_ptr() as LPCSTR);
        if rtl_get_version_.is_null() {
            return Err(Error::OsInfo(last_error()));
        }
        let rtl_get_version: extern "system" fn(PRTL_OSVERSIONINFOW) -> NTSTATUS =
            mem::transmute(rtl_get_version_);
        rtl_get_version(&mut version_info as *mut OSVERSIONINFOEXW as PRTL_OSVERSIONINFOW)
    };
    if status < 0 {
        return Err(Error::OsInfo(format!("RtlGetVersion -> 0x{:08x}", status)));
    }

    let mut system_info: SYSTEM_INFO = unsafe { mem::zeroed() };
    let processor_architecture = unsafe {
        GetNativeSystemInfo(&mut system_info);
        system_info.u.s().wProcessorArchitecture
    };

    Ok(OsInfo {
        major: version_info.dwMajorVersion,
        minor: version_info.dwMinorVersion,
        sp_major: version_info.wServicePackMajor,
        sp_minor: version_info.wServicePackMinor,
        product_type: version_info.wProductType,
        processor_architecture,
    })
}

/// Map `name` into the process (a no-op when it is already loaded) and
/// report where it lives. For a 32-bit process on a 64-bit system this is
/// the SysWOW64 copy, matching the process bitness.
pub fn load_module(name: &str) -> Result<LoadedModule> {
    let not_loaded = |reason: String| Error::ModuleNotLoaded {
        module: name.to_string(),
        reason,
    };

    let wide_name = U16CString::from_str(name).map_err(|e| not_loaded(e.to_string()))?;
    let module: HMODULE = unsafe { LoadLibraryW(wide_name.as_ptr()) };
    if module.is_null() {
        return Err(not_loaded(last_error()));
    }

    let mut buffer = vec![0u16; MODULE_PATH_CAPACITY];
    let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as u32) };
    if len == 0 {
        return Err(not_loaded(last_error()));
    }
    buffer.truncate(len as usize);

    Ok(LoadedModule {
        base: module as u64,
        path: PathBuf::from(U16String::from_vec(buffer).to_os_string()),
    })
}
