//! Security and resource hardening applied to every container.
//!
//! The same `HardeningSpec` drives both the `run` arguments and the
//! fingerprint label, so a change to any limit or flag is picked up by
//! reconciliation as drift.

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::config::{HardeningConfig, RuntimeConfig};

use super::spec::{ContainerKind, SCRATCH_DIR};

/// A memory-backed writable mount on top of the read-only root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmpfsMount {
    pub target: String,
    pub size: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardeningSpec {
    /// Kept after `--cap-drop ALL`, sorted for a stable fingerprint
    pub capabilities: Vec<String>,
    pub no_new_privileges: bool,
    pub pids_limit: u32,
    pub memory: String,
    pub memory_reservation: String,
    pub cpus: Option<f64>,
    pub read_only_root: bool,
    pub tmpfs: Vec<TmpfsMount>,
    pub nofile: (u64, u64),
    pub nproc: (u64, u64),
    /// User-defined bridge network: outbound access, no host network
    pub network: String,
    /// Minimal init as PID 1: forwards the stop signal and reaps orphans
    pub init: bool,
}

/// Fingerprint input: everything whose change must trigger a recreate.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    kind: ContainerKind,
    image: &'a str,
    hardening: &'a HardeningSpec,
    mounts: &'a [(&'static str, bool)],
}

impl HardeningSpec {
    pub fn from_config(hardening: &HardeningConfig, runtime: &RuntimeConfig) -> Self {
        let mut capabilities: Vec<String> = hardening
            .capabilities
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        capabilities.sort();
        capabilities.dedup();

        Self {
            capabilities,
            no_new_privileges: true,
            pids_limit: hardening.pids_limit,
            memory: hardening.memory.clone(),
            memory_reservation: hardening.memory_reservation.clone(),
            cpus: hardening.cpus,
            read_only_root: true,
            tmpfs: vec![
                TmpfsMount {
                    target: "/tmp".to_string(),
                    size: hardening.tmp_size.clone(),
                    mode: "1777".to_string(),
                },
                TmpfsMount {
                    target: SCRATCH_DIR.to_string(),
                    size: hardening.scratch_size.clone(),
                    mode: "1777".to_string(),
                },
                TmpfsMount {
                    target: "/run".to_string(),
                    size: hardening.run_size.clone(),
                    mode: "755".to_string(),
                },
            ],
            nofile: hardening.nofile,
            nproc: hardening.nproc,
            network: runtime.network.clone(),
            init: true,
        }
    }

    /// `run` flags implementing this spec (labels, mounts and image are added
    /// by the caller).
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["--cap-drop".to_string(), "ALL".to_string()];
        if self.init {
            args.push("--init".to_string());
        }
        for cap in &self.capabilities {
            args.extend(["--cap-add".to_string(), cap.clone()]);
        }
        if self.no_new_privileges {
            args.extend([
                "--security-opt".to_string(),
                "no-new-privileges:true".to_string(),
            ]);
        }
        args.extend(["--pids-limit".to_string(), self.pids_limit.to_string()]);
        if self.read_only_root {
            args.push("--read-only".to_string());
        }
        for tmpfs in &self.tmpfs {
            args.extend([
                "--tmpfs".to_string(),
                format!(
                    "{}:rw,nosuid,nodev,size={},mode={}",
                    tmpfs.target, tmpfs.size, tmpfs.mode
                ),
            ]);
        }
        // Soft reservation below the hard limit: reclaim before OOM kill.
        // Swap is pinned to the hard limit so it cannot be used to escape it.
        args.extend(["--memory".to_string(), self.memory.clone()]);
        args.extend([
            "--memory-reservation".to_string(),
            self.memory_reservation.clone(),
        ]);
        args.extend(["--memory-swap".to_string(), self.memory.clone()]);
        if let Some(cpus) = self.cpus {
            args.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        args.extend([
            "--ulimit".to_string(),
            format!("nofile={}:{}", self.nofile.0, self.nofile.1),
        ]);
        args.extend([
            "--ulimit".to_string(),
            format!("nproc={}:{}", self.nproc.0, self.nproc.1),
        ]);
        args.extend(["--network".to_string(), self.network.clone()]);
        args
    }

    /// Short hex digest of the hardening spec, image and the kind's mount
    /// layout.
    pub fn fingerprint(&self, kind: ContainerKind, image: &str) -> String {
        let input = FingerprintInput {
            kind,
            image,
            hardening: self,
            mounts: kind.mount_layout(),
        };
        // Serializing a struct of plain fields cannot fail
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        let digest = hex::encode(Sha1::digest(&bytes));
        digest[..16].to_string()
    }
}
