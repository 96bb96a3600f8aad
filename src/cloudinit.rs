//! Cloud-init seed generation.
//!
//! Renders `user-data` (from a template with the caller's public key) and
//! `meta-data` (instance identity plus a static network stanza for the
//! private bridge subnet), then packs both into a `cidata`-labelled ISO the
//! guest's cloud-init reads at first boot.

use crate::command::run;
use crate::config::GATEWAY_IP;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Placeholder substituted with the caller's public key in the template.
const SSH_KEY_VAR: &str = "{{.SSHKey}}";

/// DNS server handed to the guest.
const GUEST_DNS: &str = "8.8.8.8";

/// Render user-data from the template file, substituting the public key.
pub fn render_user_data(template_path: &Path, public_key: &str) -> Result<String> {
    let template = std::fs::read_to_string(template_path).map_err(|e| {
        Error::seed(format!(
            "load template {}: {}",
            template_path.display(),
            e
        ))
    })?;
    Ok(template.replace(SSH_KEY_VAR, public_key))
}

/// Render the meta-data document: instance identity and a static v2 network
/// config putting eth0 on the private subnet.
pub fn render_meta_data(instance_id: &str, guest_ip: Ipv4Addr) -> String {
    format!(
        "instance-id: i-{id}
local-hostname: microvm
network:
  version: 2
  ethernets:
    eth0:
      addresses:
        - {ip}/24
      gateway4: {gw}
      nameservers:
        addresses: [{dns}]
",
        id = instance_id,
        ip = guest_ip,
        gw = GATEWAY_IP,
        dns = GUEST_DNS,
    )
}

/// Write user-data and meta-data into `instance_dir` and pack them into
/// `cloud-init.disk`. Returns the ISO path.
///
/// `cloud-localds` is preferred; when it is unavailable a generic ISO builder
/// is used with the `cidata` volume label and Joliet+Rock extensions.
pub fn generate_seed(
    instance_dir: &Path,
    template_path: &Path,
    public_key: &str,
    instance_id: &str,
    guest_ip: Ipv4Addr,
) -> Result<PathBuf> {
    let user_data_path = instance_dir.join("user-data");
    let meta_data_path = instance_dir.join("meta-data");
    let iso_path = instance_dir.join("cloud-init.disk");

    let user_data = render_user_data(template_path, public_key)?;
    std::fs::write(&user_data_path, user_data)
        .map_err(|e| Error::seed(format!("write user-data: {}", e)))?;

    let meta_data = render_meta_data(instance_id, guest_ip);
    std::fs::write(&meta_data_path, meta_data)
        .map_err(|e| Error::seed(format!("write meta-data: {}", e)))?;

    let iso = iso_path.to_string_lossy().to_string();
    let user = user_data_path.to_string_lossy().to_string();
    let meta = meta_data_path.to_string_lossy().to_string();

    match run("cloud-localds", &[&iso, &user, &meta]) {
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(error = %e, "cloud-localds unavailable, falling back to genisoimage");
            run(
                "genisoimage",
                &[
                    "-output", &iso, "-volid", "cidata", "-joliet", "-rock", &user, &meta,
                ],
            )
            .map_err(|e| Error::seed(format!("pack cidata iso: {}", e)))?;
        }
    }

    Ok(iso_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_user_data_substitutes_key() {
        let dir = tempfile::tempdir().unwrap();
        let tmpl = dir.path().join("user-data.yaml");
        std::fs::write(
            &tmpl,
            "#cloud-config\nusers:\n  - name: ubuntu\n    ssh_authorized_keys:\n      - {{.SSHKey}}\n",
        )
        .unwrap();

        let rendered = render_user_data(&tmpl, "ssh-ed25519 AAAA test@host").unwrap();
        assert!(rendered.contains("ssh-ed25519 AAAA test@host"));
        assert!(!rendered.contains("{{.SSHKey}}"));
    }

    #[test]
    fn test_render_user_data_missing_template() {
        let err = render_user_data(Path::new("/no/such/template"), "k").unwrap_err();
        assert!(matches!(err, Error::Seed(_)));
    }

    #[test]
    fn test_meta_data_is_clean_yaml() {
        let doc = render_meta_data("abc123", Ipv4Addr::new(172, 16, 0, 3));
        assert!(doc.starts_with("instance-id: i-abc123\n"));
        assert!(doc.contains("local-hostname: microvm\n"));
        assert!(doc.contains("- 172.16.0.3/24"));
        assert!(doc.contains("gateway4: 172.16.0.1"));
        assert!(doc.contains("addresses: [8.8.8.8]"));
        // No tab artifacts; two-space indentation only.
        assert!(!doc.contains('\t'));
        for line in doc.lines() {
            let indent = line.len() - line.trim_start().len();
            assert_eq!(indent % 2, 0, "odd indentation in line: {:?}", line);
        }
    }

    #[test]
    fn test_meta_data_uses_instance_ip() {
        let doc = render_meta_data("x", Ipv4Addr::new(172, 16, 0, 17));
        assert!(doc.contains("- 172.16.0.17/24"));
    }
}
