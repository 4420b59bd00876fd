//! Injected child-process command builder.

use std::collections::HashMap;
use std::ffi::OsString;

use crate::config::ProgressMode;

/// Fully-resolved child process invocation.
#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub executable: OsString,
    pub args: Vec<OsString>,
    pub env: HashMap<String, String>,
}

/// Implemented by the embedding host to build the child video-client
/// invocation. Required shape:
///
/// - input options before `-i`, output options after;
/// - a per-client `User-Agent` of the form `<swarm>/<ver>/client-<id>`;
/// - the progress flag matching the chosen transport
///   (`unix://<path>` or `pipe:1`);
/// - `null` muxer output, `-map 0 -c copy` (no transcoding).
pub trait CommandBuilder: Send + Sync {
    fn build_command(
        &self,
        client_id: u32,
        playlist_url: &str,
        progress_mode: ProgressMode,
        progress_target: &str,
        swarm_name: &str,
        swarm_version: &str,
    ) -> anyhow::Result<BuiltCommand>;
}

/// A placeholder builder used only as a `Config` default; callers must
/// supply a real `CommandBuilder` (the child binary is an external
/// collaborator outside this crate's control).
pub struct NullCommandBuilder;

impl CommandBuilder for NullCommandBuilder {
    fn build_command(
        &self,
        client_id: u32,
        _playlist_url: &str,
        _progress_mode: ProgressMode,
        _progress_target: &str,
        _swarm_name: &str,
        _swarm_version: &str,
    ) -> anyhow::Result<BuiltCommand> {
        anyhow::bail!(
            "no CommandBuilder configured for client {client_id}; supply one in Config"
        )
    }
}

/// Reference builder matching the expected ffmpeg-style child invocation,
/// useful for tests and as documentation of the expected argument shape.
pub struct FfmpegStyleBuilder {
    pub executable: OsString,
}

impl CommandBuilder for FfmpegStyleBuilder {
    fn build_command(
        &self,
        client_id: u32,
        playlist_url: &str,
        progress_mode: ProgressMode,
        progress_target: &str,
        swarm_name: &str,
        swarm_version: &str,
    ) -> anyhow::Result<BuiltCommand> {
        let user_agent = format!("{swarm_name}/{swarm_version}/client-{client_id}");
        let progress_flag = match progress_mode {
            ProgressMode::UnixSocket => format!("unix://{progress_target}"),
            ProgressMode::Stdout => "pipe:1".to_string(),
        };

        let args: Vec<OsString> = [
            "-user_agent",
            &user_agent,
            "-i",
            playlist_url,
            "-map",
            "0",
            "-c",
            "copy",
            "-progress",
            &progress_flag,
            "-f",
            "null",
            "-",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        Ok(BuiltCommand {
            executable: self.executable.clone(),
            args,
            env: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_builder_places_input_before_dash_i_and_output_after() {
        let builder = FfmpegStyleBuilder {
            executable: "ffmpeg".into(),
        };
        let cmd = builder
            .build_command(
                3,
                "https://example.com/live.m3u8",
                ProgressMode::UnixSocket,
                "/tmp/sock-3",
                "hls-swarm",
                "0.1.0",
            )
            .unwrap();

        let args: Vec<String> = cmd.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        let ua_pos = args.iter().position(|a| a == "-user_agent").unwrap();
        let map_pos = args.iter().position(|a| a == "-map").unwrap();

        assert!(ua_pos < i_pos, "user-agent is an input option, must precede -i");
        assert!(map_pos > i_pos, "-map is an output option, must follow -i");
        assert!(args.contains(&"unix:///tmp/sock-3".to_string()));
        assert!(args[ua_pos + 1].contains("client-3"));
    }
}
