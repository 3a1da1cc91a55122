mod add;
mod check_config;
mod cleanup_cache;
mod find_unseeded;
mod ls;
mod rm;
mod scan;
mod scan_clients;
mod test_connection;

pub use add::AddArgs;
pub use check_config::CheckConfigArgs;
pub use cleanup_cache::CleanupCacheArgs;
pub use find_unseeded::FindUnseededArgs;
pub use ls::LsArgs;
pub use rm::RmArgs;
pub use scan::ScanArgs;
pub use scan_clients::ScanClientsArgs;
pub use test_connection::TestConnectionArgs;
