// sitebackup/src/backup/site_sync.rs
//! Commands that copy the application off the web host and toggle its
//! maintenance flag.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::{TransportConfig, WebServerConfig};
use crate::utils::command::{Invocation, SshTarget, rsync_remote_shell};

/// Pulls `remote_dir` from `host` into `local_dir` with rsync over SSH.
pub fn pull_invocation(
    transport: &TransportConfig,
    host: &SshTarget,
    remote_dir: &str,
    local_dir: &Path,
) -> Invocation {
    let mut destination = local_dir.as_os_str().to_owned();
    destination.push("/");
    let args = vec![
        OsString::from("-az"),
        // A staging tree left by an interrupted run is reused, so it must mirror the source.
        OsString::from("--delete"),
        // Keeps remote paths with spaces intact without quoting them.
        OsString::from("--protect-args"),
        OsString::from("--rsh"),
        OsString::from(rsync_remote_shell(&transport.ssh_bin, host.port, transport.batch_mode)),
        OsString::from(format!("{}:{}/", host.login(), remote_dir.trim_end_matches('/'))),
        destination,
    ];
    Invocation::local(transport.rsync_bin.clone(), args)
}

pub fn code_sync_invocation(
    transport: &TransportConfig,
    web: &WebServerConfig,
    code_dir: &Path,
) -> Invocation {
    pull_invocation(transport, &web.ssh, &web.app_root, code_dir)
}

pub fn asset_sync_invocation(
    transport: &TransportConfig,
    web: &WebServerConfig,
    assets_dir: &Path,
) -> Invocation {
    pull_invocation(transport, &web.ssh, &web.media_path, assets_dir)
}

pub fn maintenance_on_invocation(web: &WebServerConfig) -> Invocation {
    Invocation::remote(web.ssh.clone(), "touch", [web.maintenance_flag_path()])
}

pub fn maintenance_off_invocation(web: &WebServerConfig) -> Invocation {
    Invocation::remote(web.ssh.clone(), "rm", [web.maintenance_flag_path()])
}

/// Removes the configured subpaths from the staged code tree.
pub fn exclusion_invocation(code_dir: &Path, exclude_paths: &[PathBuf]) -> Invocation {
    let mut args = vec![OsString::from("-rf"), OsString::from("--")];
    args.extend(exclude_paths.iter().map(|p| code_dir.join(p).into_os_string()));
    Invocation::local("rm", args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::Target;

    fn web() -> WebServerConfig {
        WebServerConfig {
            ssh: SshTarget {
                user: "copious".to_string(),
                host: "web.example.com".to_string(),
                port: 2200,
            },
            app_root: "/srv/my shop/".to_string(),
            media_path: "/srv/my shop/media".to_string(),
            maintenance_flag: true,
        }
    }

    fn strings(invocation: &Invocation) -> Vec<String> {
        invocation
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn code_sync_pulls_app_root_contents() {
        let invocation = code_sync_invocation(&TransportConfig::default(), &web(), Path::new("/b/staging/code"));
        assert_eq!(invocation.target, Target::Local);
        assert_eq!(invocation.program, "rsync");
        assert_eq!(
            strings(&invocation),
            vec![
                "-az",
                "--delete",
                "--protect-args",
                "--rsh",
                "ssh -p 2200 -o BatchMode=yes",
                "copious@web.example.com:/srv/my shop/",
                "/b/staging/code/",
            ]
        );
    }

    #[test]
    fn asset_sync_pulls_media_path() {
        let invocation = asset_sync_invocation(&TransportConfig::default(), &web(), Path::new("/b/staging/assets"));
        let args = strings(&invocation);
        assert_eq!(args[5], "copious@web.example.com:/srv/my shop/media/");
        assert_eq!(args[6], "/b/staging/assets/");
    }

    #[test]
    fn maintenance_flag_is_toggled_on_web_host() {
        let on = maintenance_on_invocation(&web());
        let off = maintenance_off_invocation(&web());
        assert_eq!(on.target, Target::Remote(web().ssh));
        assert_eq!(on.program, "touch");
        assert_eq!(strings(&on), vec!["/srv/my shop/maintenance.flag"]);
        assert_eq!(off.program, "rm");
        assert_eq!(strings(&off), vec!["/srv/my shop/maintenance.flag"]);
    }

    #[test]
    fn exclusion_targets_only_staged_paths() {
        let invocation = exclusion_invocation(
            Path::new("/b/staging/code"),
            &[PathBuf::from("var/cache"), PathBuf::from("media")],
        );
        assert_eq!(invocation.target, Target::Local);
        assert_eq!(
            strings(&invocation),
            vec!["-rf", "--", "/b/staging/code/var/cache", "/b/staging/code/media"]
        );
    }
}
