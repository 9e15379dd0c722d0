// sing-box / cloudflared を束ねるローカルオーケストレーター
// ポート解決 → 割り当て → プロセス監視 → トンネル → 購読の公開

pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod planner;
pub mod port_resolver;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod tunnel;

// パブリックAPI
pub use config::Config;
pub use error::{exit_code_of, Error};
pub use runtime::run;
