use figment::Figment;
use figment::providers::Env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Figment> = OnceLock::new();

/// Settings provider reading `IDC_ETL_*` environment variables. Nested keys are
/// separated by `__`, e.g. `IDC_ETL_TCIA__KIND=manifest`.
pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(|| Figment::new().merge(Env::prefixed("IDC_ETL_").split("__")))
}
