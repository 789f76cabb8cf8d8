const fn unwrap_or_cargo_version(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Build-time override via `APP_VERSION`, otherwise the package version.
pub const VERSION: &str = unwrap_or_cargo_version(option_env!("APP_VERSION"));

/// Name reported to the gateway in the IDENTIFY properties.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
