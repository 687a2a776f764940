//! Administrative `plugins` command.

use std::path::{Path, PathBuf};

use crate::config::PluginConfig;
use crate::context::PluginState;
use crate::host::PluginHost;
use crate::plugin::PLUGIN_API_VERSION;
use crate::registry::PluginSummary;

/// Permission an invoker needs to manage plugins.
pub const PLUGIN_ADMIN_PERMISSION: &str = "can_execute_plugin_commands";

pub const USAGE: &str = "Valid usage: plugins [option]\n\
  list - List all plugins currently loaded.\n\
  start / load - Loads a plugin not currently loaded.\n\
  stop / unload - Unloads a plugin currently loaded.\n\
  restart / reload - Reloads a plugin currently loaded.\n\
  version - Show the host API version.";

/// Where command replies go, and who is asking.
pub trait CommandReply {
    fn reply(&mut self, message: &str);

    fn has_permission(&self, _permission: &str) -> bool {
        true
    }
}

impl CommandReply for Vec<String> {
    fn reply(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

/// A parsed `plugins` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCommand {
    List,
    Load(Option<String>),
    Unload(Option<String>),
    Reload(Option<String>),
    Version,
    Usage,
}

impl PluginCommand {
    /// Parse the arguments following `plugins`.
    pub fn parse(args: &[&str]) -> Self {
        let target = args.get(1).map(|s| s.to_string());
        match args.first().copied() {
            Some("list") => PluginCommand::List,
            Some("start") | Some("load") => PluginCommand::Load(target),
            Some("stop") | Some("unload") => PluginCommand::Unload(target),
            Some("restart") | Some("reload") => PluginCommand::Reload(target),
            Some("version") => PluginCommand::Version,
            _ => PluginCommand::Usage,
        }
    }
}

/// Expand a `load` argument to a file path.
///
/// `Name` becomes `<root>/plugins/Name/Name.<ext>`; anything ending in the
/// library extension is taken relative to the root.
pub fn resolve_plugin_path(config: &PluginConfig, arg: &str) -> PathBuf {
    let suffix = format!(".{}", config.library_extension);
    if arg.ends_with(&suffix) {
        config.root_dir.join(arg)
    } else {
        config
            .plugins_dir()
            .join(arg)
            .join(config.library_file_name(arg))
    }
}

/// One listing line for a plugin.
pub fn format_summary(summary: &PluginSummary) -> String {
    let meta = &summary.metadata;
    let mut line = format!("  [#{}]: \"{}\" ({})", summary.id, meta.name, meta.version);
    if !meta.author.is_empty() {
        line.push_str(&format!(" by {}", meta.author));
    }
    if summary.state != PluginState::Loaded {
        line.push_str(&format!(" [{}]", summary.state));
    }
    if !meta.description.is_empty() {
        line.push_str("\n    ");
        line.push_str(&meta.description);
    }
    line
}

/// Run a parsed command against `host`. Every outcome becomes a reply.
pub fn execute(host: &mut PluginHost, command: PluginCommand, reply: &mut dyn CommandReply) {
    if !reply.has_permission(PLUGIN_ADMIN_PERMISSION) {
        reply.reply("You do not have the correct permissions to execute this command.");
        return;
    }

    match command {
        PluginCommand::List => {
            let summaries = host.registry().summaries();
            let loaded = summaries
                .iter()
                .filter(|s| s.state == PluginState::Loaded)
                .count();
            reply.reply(&format!(
                "  List of all plugins currently loaded: {} plugins loaded.",
                loaded
            ));
            for summary in &summaries {
                reply.reply(&format_summary(summary));
            }
        }
        PluginCommand::Load(None) => reply.reply(
            "Valid usage: plugins load [relative plugin path || absolute plugin path] \
             (e.g \"TestPlugin\", \"plugins/TestPlugin/TestPlugin.so\")",
        ),
        PluginCommand::Load(Some(arg)) => {
            let path = resolve_plugin_path(host.config(), &arg);
            match host.load_plugin(&path) {
                Ok(summary) => reply.reply(&format!(
                    "Loaded plugin \"{}\" (#{}).",
                    summary.metadata.name, summary.id
                )),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load plugin {:?}", path);
                    reply.reply(&format!("Failed to load plugin {}: {}", display(&path), e));
                }
            }
        }
        PluginCommand::Unload(None) => reply.reply(
            "Valid usage: plugins unload [plugin name || #plugin id] (e.g \"TestPlugin\", \"1\")",
        ),
        PluginCommand::Unload(Some(query)) => match host.unload_plugin(&query) {
            Ok(summary) => reply.reply(&format!(
                "Unloaded plugin \"{}\" (#{}).",
                summary.metadata.name, summary.id
            )),
            Err(_) => reply.reply(&format!("Could not unload plugin \"{}\"", query)),
        },
        PluginCommand::Reload(None) => reply.reply(
            "Valid usage: plugins reload [plugin name || #plugin id] (e.g \"TestPlugin\", \"#1\")",
        ),
        PluginCommand::Reload(Some(query)) => {
            if host.registry().find_by_id_or_name(&query).is_none() {
                reply.reply(&format!("Could not reload plugin \"{}\"", query));
                return;
            }
            match host.reload_plugin(&query) {
                Ok(summary) => reply.reply(&format!(
                    "Reloaded plugin \"{}\" (#{}).",
                    summary.metadata.name, summary.id
                )),
                Err(e) => {
                    tracing::error!(plugin = %query, error = %e, "Failed to reload plugin");
                    reply.reply(&format!("Failed to reload plugin \"{}\": {}", query, e));
                }
            }
        }
        PluginCommand::Version => {
            reply.reply(&format!("  Current API Version: {}", PLUGIN_API_VERSION));
        }
        PluginCommand::Usage => reply.reply(USAGE),
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
