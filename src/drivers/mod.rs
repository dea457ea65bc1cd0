//! The default archive driver family.

use std::sync::Arc;

use crate::addr::Scheme;
use crate::driver::DriverRegistry;

pub mod raes;
pub mod tar;
pub mod zip;

pub use raes::{ConstantKeyProvider, KeyProvider, NoKeyProvider, RaesDriver};
pub use tar::{TarCompression, TarDriver};
pub use zip::{ZipDriver, ZipInputService, ZipOutputService};

/// The canonical scheme/extension table.
///
/// | scheme   | extensions                  |
/// |----------|-----------------------------|
/// | `zip`    | zip                         |
/// | `jar`    | jar, war, ear               |
/// | `odf`    | the OpenDocument family     |
/// | `exe`    | exe (read-only)             |
/// | `tar`    | tar                         |
/// | `targz`  | tgz, tar.gz                 |
/// | `tarbz2` | tbz, tb2, tar.bz2           |
/// | `tarxz`  | tar.xz                      |
/// | `tzp`    | tzp (RAES-encrypted ZIP)    |
pub fn default_registry(keys: Arc<dyn KeyProvider>) -> DriverRegistry {
    let scheme = |s: &str| Scheme::new(s).expect("built-in schemes are valid");
    let mut registry = DriverRegistry::new();
    registry.register(scheme("zip"), &["zip"], Arc::new(ZipDriver::new()));
    registry.register(scheme("jar"), &["jar", "war", "ear"], Arc::new(ZipDriver::jar()));
    registry.register(
        scheme("odf"),
        &[
            "odt", "ott", "odg", "otg", "odp", "otp", "ods", "ots", "odc", "otc", "odi", "oti",
            "odf", "otf", "odm", "oth", "odb",
        ],
        Arc::new(ZipDriver::odf()),
    );
    registry.register(scheme("exe"), &["exe"], Arc::new(ZipDriver::exe()));
    registry.register(scheme("tar"), &["tar"], Arc::new(TarDriver::new()));
    registry.register(scheme("targz"), &["tgz", "tar.gz"], Arc::new(TarDriver::gzip()));
    registry.register(
        scheme("tarbz2"),
        &["tbz", "tb2", "tar.bz2"],
        Arc::new(TarDriver::bzip2()),
    );
    registry.register(scheme("tarxz"), &["tar.xz"], Arc::new(TarDriver::xz()));
    registry.register(scheme("tzp"), &["tzp"], Arc::new(RaesDriver::new(keys)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_extension_table() {
        let registry = default_registry(Arc::new(NoKeyProvider));
        for (name, expected) in [
            ("a.zip", "zip"),
            ("lib.jar", "jar"),
            ("doc.odt", "odf"),
            ("setup.exe", "exe"),
            ("data.tar", "tar"),
            ("data.tar.gz", "targz"),
            ("data.tgz", "targz"),
            ("data.tar.bz2", "tarbz2"),
            ("data.tar.xz", "tarxz"),
            ("secret.tzp", "tzp"),
        ] {
            assert_eq!(
                registry.scheme_for(name).map(|s| s.as_str()),
                Some(expected),
                "extension mapping for {name}"
            );
        }
        assert_eq!(registry.scheme_for("notes.txt"), None);
    }
}
