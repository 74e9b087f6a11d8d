use crate::config::ServiceConfig;
use crate::settings::ServerBinary;
use std::process::Stdio;
use tokio::process::Command;

/// Arguments for the file server derived from a service definition.
pub(crate) fn server_args(config: &ServiceConfig) -> Vec<String> {
    let mut args = vec![
        config.root_path.to_string_lossy().into_owned(),
        "--port".to_string(),
        config.port.to_string(),
    ];
    if let Some(bind) = config.bind.as_deref().filter(|b| !b.is_empty()) {
        args.push("--bind".into());
        args.push(bind.to_string());
    }
    let p = &config.permissions;
    for (enabled, flag) in [
        (p.allow_upload, "--allow-upload"),
        (p.allow_delete, "--allow-delete"),
        (p.allow_search, "--allow-search"),
        (p.allow_archive, "--allow-archive"),
    ] {
        if enabled {
            args.push(flag.to_string());
        }
    }
    if let Some(auth) = &config.auth {
        if !auth.username.is_empty() && !auth.secret.is_empty() {
            args.push("--auth".into());
            args.push(format!("{}:{}@/:rw", auth.username, auth.secret.expose()));
        }
    }
    args
}

/// Same arguments with credentials masked, for logs.
pub(crate) fn redacted(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            let user = arg.split(':').next().unwrap_or_default();
            out.push(format!("{user}:***"));
            mask_next = false;
        } else {
            mask_next = arg == "--auth";
            out.push(arg.clone());
        }
    }
    out.join(" ")
}

/// A child with piped output that dies with its handle.
pub(crate) fn piped<I, S>(program: &std::path::Path, leading: &[String], args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(leading)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW
        cmd.creation_flags(0x0800_0000);
    }
    cmd
}

pub(crate) fn server_command(binary: &ServerBinary, config: &ServiceConfig) -> (Command, String) {
    let args = server_args(config);
    let shown = format!("{} {}", binary.program.display(), redacted(&args));
    (piped(&binary.program, &binary.leading_args, args), shown)
}
