use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use app_dirs::{app_dir, AppDataType};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pdb_store;
use crate::pe_image::ModuleImage;
use crate::APP_INFO;

pub const PDB_SERVER_PATH: &str = "http://msdl.microsoft.com/download/symbols";
pub const SYMBOL_PATH_ENV: &str = "_NT_SYMBOL_PATH";

// msdl serves some files only to clients that look like symsrv
const USER_AGENT: &str = "Microsoft-Symbol-Server/10.0.0.0";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Upstream of a `srv*` element: either an HTTP symbol server or a
/// symbol store on disk / a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Store {
    Http(String),
    Dir(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// `srv*[cache*...]*store`
    Server { caches: Vec<PathBuf>, store: Store },
    /// `cache*dir`, used as the download cache of later servers without one
    Cache(PathBuf),
    /// plain directory holding `<pdbname>` or a symbol store tree
    Local(PathBuf),
}

/// Parsed DbgHelp-style symbol search path.
#[derive(Debug, Clone)]
pub struct SymbolPath {
    pub elements: Vec<Element>,
    raw: String,
    default_cache: PathBuf,
}

impl SymbolPath {
    pub fn parse(path: &str, default_cache: &Path) -> Result<Self> {
        let mut elements = Vec::new();
        for raw in path.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            elements.push(parse_element(raw)?);
        }
        Ok(SymbolPath {
            elements,
            raw: path.to_string(),
            default_cache: default_cache.to_path_buf(),
        })
    }

    /// `--symbol-path` beats `_NT_SYMBOL_PATH`, which beats the public server
    /// cached under the application data directory.
    pub fn from_config(explicit: Option<&str>) -> Result<Self> {
        let default_cache = default_cache_dir()?;
        let env_path = std::env::var(SYMBOL_PATH_ENV).ok();
        let path = match explicit.or_else(|| env_path.as_deref()) {
            Some(p) => p.to_string(),
            None => format!("srv*{}*{}", default_cache.display(), PDB_SERVER_PATH),
        };
        debug!("Symbol search path: {}", path);
        Self::parse(&path, &default_cache)
    }

    /// Find the PDB matching `image`, downloading it when no local copy
    /// exists. Failures of a single location are logged and the search
    /// moves on to the next one.
    pub fn find_pdb(&self, image: &ModuleImage) -> Result<PathBuf> {
        self.find_pdb_with(image, |flat| pdb_store::matches_image(flat, image))
    }

    /// `find_pdb` with the signature check of flat `<dir>/<pdbname>` files
    /// supplied by the caller. Symbol store hits are keyed by GUID and age
    /// already and are taken as they are.
    pub fn find_pdb_with<F>(&self, image: &ModuleImage, accept_flat: F) -> Result<PathBuf>
    where
        F: Fn(&Path) -> bool,
    {
        let pdbname = &image.pdb_name;
        let key = image.symbol_key();
        let mut download_cache = self.default_cache.clone();

        for element in &self.elements {
            match element {
                Element::Local(dir) => {
                    let flat = dir.join(pdbname);
                    if flat.exists() {
                        if accept_flat(&flat) {
                            debug!("Found {:?}", flat);
                            return Ok(flat);
                        }
                        debug!("{:?} does not match {}", flat, key);
                    }
                    if let Some(hit) = lookup_store(dir, pdbname, &key) {
                        return Ok(hit);
                    }
                }
                Element::Cache(dir) => {
                    if let Some(hit) = lookup_store(dir, pdbname, &key) {
                        return Ok(hit);
                    }
                    download_cache = dir.clone();
                }
                Element::Server { caches, store } => {
                    for cache in caches {
                        if let Some(hit) = lookup_store(cache, pdbname, &key) {
                            return Ok(hit);
                        }
                    }
                    let target = store_path(
                        caches.first().unwrap_or(&download_cache),
                        pdbname,
                        &key,
                    );
                    match fetch(store, pdbname, &key, &target) {
                        Ok(path) => return Ok(path),
                        Err(e) => warn!("{} not available from {:?}: {}", pdbname, store, e),
                    }
                }
            }
        }

        Err(Error::PdbUnavailable(self.raw.clone(), pdbname.to_string()))
    }
}

fn parse_element(raw: &str) -> Result<Element> {
    let parts: Vec<&str> = raw.split('*').collect();
    if parts.len() == 1 {
        return Ok(Element::Local(PathBuf::from(raw)));
    }

    let head = parts[0].to_ascii_lowercase();
    let rest = match head.as_str() {
        "srv" => &parts[1..],
        // symsrv*symsrv.dll*cache*store
        "symsrv" if parts.len() > 2 => &parts[2..],
        "cache" => {
            return match parts[1..].iter().find(|p| !p.is_empty()) {
                Some(dir) => Ok(Element::Cache(PathBuf::from(dir))),
                None => Err(Error::InvalidSymbolPath(raw.to_string())),
            };
        }
        _ => return Err(Error::InvalidSymbolPath(raw.to_string())),
    };

    let (store, caches) = match rest.split_last() {
        Some((&store, caches)) if !store.is_empty() => (store, caches),
        _ => return Err(Error::InvalidSymbolPath(raw.to_string())),
    };
    let lower = store.to_ascii_lowercase();
    let store = if lower.starts_with("http://") || lower.starts_with("https://") {
        Store::Http(store.trim_end_matches('/').to_string())
    } else {
        Store::Dir(PathBuf::from(store))
    };
    let caches = caches
        .iter()
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .collect();

    Ok(Element::Server { caches, store })
}

pub fn default_cache_dir() -> Result<PathBuf> {
    Ok(app_dir(AppDataType::UserCache, &APP_INFO, "symbols")?)
}

/// `<root>\<pdbname>\<GUID><AGE>\<pdbname>`
pub fn store_path(root: &Path, pdbname: &str, key: &str) -> PathBuf {
    root.join(pdbname).join(key).join(pdbname)
}

pub fn download_url(server: &str, pdbname: &str, key: &str) -> String {
    format!("{}/{}/{}/{}", server.trim_end_matches('/'), pdbname, key, pdbname)
}

fn lookup_store(root: &Path, pdbname: &str, key: &str) -> Option<PathBuf> {
    let candidate = store_path(root, pdbname, key);
    if candidate.exists() {
        debug!("Found {:?}", candidate);
        Some(candidate)
    } else {
        debug!("Not in {:?}", candidate);
        None
    }
}

fn fetch(store: &Store, pdbname: &str, key: &str, target: &Path) -> Result<PathBuf> {
    match store {
        Store::Dir(root) => {
            let source = store_path(root, pdbname, key);
            if !source.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{:?} does not exist", source),
                )
                .into());
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            info!("Copying {:?} into {:?}", source, target);
            fs::copy(&source, target)?;
            Ok(target.to_path_buf())
        }
        Store::Http(server) => {
            let url = download_url(server, pdbname, key);
            info!("PDB not found, download into {:?}", target);
            download_pdb(&url, target)?;
            Ok(target.to_path_buf())
        }
    }
}

fn download_pdb(url: &str, outfile: &Path) -> Result<()> {
    info!("{}", url);
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    let resp = client.get(url).send()?;
    if !resp.status().is_success() {
        return Err(Error::DownloadFailed {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    if let Some(parent) = outfile.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut partial = outfile.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let pb = ProgressBar::new(resp.content_length().unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }

    let copied = File::create(&partial).and_then(|mut out| io::copy(&mut pb.wrap_read(resp), &mut out));
    pb.finish_and_clear();
    match copied {
        Ok(n) => {
            fs::rename(&partial, outfile)?;
            info!("Download of {:?} has been completed ({} bytes)", outfile, n);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}
