//! Configuration for hashgraphd
//!
//! The command line selects files and identities; the algorithm tunables
//! live in a JSON [`PlatformConfig`] whose sections are validated before any
//! component is constructed.

use anyhow::Context;
use clap::Parser;
use hashgraph_consensus::ConsensusConfig;
use hashgraph_core::types::{NodeId, Roster, RosterEntry, Threshold};
use hashgraph_net::PeerInfo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// hashgraphd - hashgraph consensus node
#[derive(Parser, Debug, Clone)]
#[command(name = "hashgraphd")]
#[command(about = "Leaderless BFT consensus node using hashgraph virtual voting")]
pub struct Config {
    /// Listen address for gossip connections
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Data directory for the node database and preconsensus event files
    #[arg(short, long, default_value = "./data/hashgraphd")]
    pub data_dir: PathBuf,

    /// This node's id in the roster
    #[arg(long, env = "HASHGRAPH_NODE_ID")]
    pub node_id: u64,

    /// Path to the roster JSON file
    #[arg(long)]
    pub roster: PathBuf,

    /// Path to the platform configuration JSON file
    #[arg(long)]
    pub platform_config: Option<PathBuf>,

    /// PEM certificate this node presents on peer links
    #[arg(long)]
    pub tls_cert: PathBuf,

    /// PEM private key of the TLS certificate
    #[arg(long)]
    pub tls_key: PathBuf,

    /// Hex-encoded 32-byte signing key seed; generated and stored if absent
    #[arg(long, env = "HASHGRAPH_KEY_SEED", hide_env_values = true)]
    pub key_seed: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {}", self.log_format);
        }
        if let Some(seed) = &self.key_seed {
            parse_key_seed(seed)?;
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// Key seed from the command line, if given
    pub fn key_seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        self.key_seed.as_deref().map(parse_key_seed).transpose()
    }

    /// Load and validate the platform configuration, defaulting every section
    pub fn load_platform_config(&self) -> anyhow::Result<PlatformConfig> {
        let config = match &self.platform_config {
            Some(path) => PlatformConfig::load(path)?,
            None => PlatformConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn pces_dir(&self) -> PathBuf {
        self.data_dir.join("pces")
    }
}

fn parse_key_seed(seed: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(seed.trim()).context("Key seed is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key seed must be 32 bytes, got {}", b.len()))
}

// =============================================================================
// ROSTER FILE
// =============================================================================

/// One member of the roster file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterMember {
    pub node_id: NodeId,
    pub weight: u64,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Gossip address
    pub address: SocketAddr,
    /// Hex-encoded DER certificate pinned for this member's TLS links
    pub tls_certificate: String,
}

/// Roster as distributed to every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterFile {
    pub members: Vec<RosterMember>,
}

impl RosterFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read roster {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse roster {}", path.display()))
    }

    /// Consensus roster plus gossip addresses of every member
    pub fn into_roster(self) -> anyhow::Result<(Roster, Vec<PeerInfo>)> {
        let mut entries = Vec::with_capacity(self.members.len());
        let mut peers = Vec::with_capacity(self.members.len());
        for member in self.members {
            let key: [u8; 32] = hex::decode(&member.public_key)
                .with_context(|| format!("Public key of {} is not valid hex", member.node_id))?
                .try_into()
                .map_err(|_| anyhow::anyhow!("Public key of {} is not 32 bytes", member.node_id))?;
            entries.push(RosterEntry {
                node_id: member.node_id,
                weight: member.weight,
                public_key: key,
            });
            let certificate = hex::decode(&member.tls_certificate)
                .with_context(|| format!("TLS certificate of {} is not valid hex", member.node_id))?;
            if certificate.is_empty() {
                anyhow::bail!("TLS certificate of {} is empty", member.node_id);
            }
            peers.push(PeerInfo::new(
                member.node_id,
                member.address,
                key,
                certificate,
            ));
        }
        Ok((Roster::new(entries)?, peers))
    }
}

// =============================================================================
// PLATFORM CONFIGURATION
// =============================================================================

/// All tunables of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    pub consensus: ConsensusConfig,
    pub creator: CreatorConfig,
    pub intake: IntakeConfig,
    pub sync: SyncConfig,
    pub pces: PcesConfig,
}

impl PlatformConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read platform config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse platform config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.consensus.validate()?;
        self.creator.validate()?;
        self.intake.validate()?;
        self.sync.validate()?;
        self.pces.validate()?;
        Ok(())
    }
}

/// Event creation policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CreatorConfig {
    /// Minimum time between two events of this node
    pub min_creation_interval_ms: u64,
    /// Score penalty per consecutive choice of the same other-parent creator
    pub anti_selfishness_factor: u64,
    /// Distinct other-parent creators allowed per birth round
    pub max_other_parents_per_round: usize,
    /// Transactions packed into one event
    pub max_transactions_per_event: usize,
    /// Transactions waiting for an event
    pub max_pool_size: usize,
}

impl Default for CreatorConfig {
    fn default() -> Self {
        Self {
            min_creation_interval_ms: 20,
            anti_selfishness_factor: 1,
            max_other_parents_per_round: 16,
            max_transactions_per_event: 256,
            max_pool_size: 100_000,
        }
    }
}

impl CreatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_other_parents_per_round == 0 {
            anyhow::bail!("creator.max_other_parents_per_round must be positive");
        }
        if self.max_transactions_per_event == 0 {
            anyhow::bail!("creator.max_transactions_per_event must be positive");
        }
        Ok(())
    }

    pub fn min_creation_interval(&self) -> Duration {
        Duration::from_millis(self.min_creation_interval_ms)
    }
}

/// Event intake limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntakeConfig {
    /// Maximum total transaction payload of one event
    pub max_transaction_bytes: usize,
    /// Events verified per blocking task
    pub verify_batch_size: usize,
    /// Consensus queue length above which the node sheds gossip load
    pub max_backlog: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_transaction_bytes: 1024 * 1024,
            verify_batch_size: 64,
            max_backlog: 10_000,
        }
    }
}

impl IntakeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.verify_batch_size == 0 {
            anyhow::bail!("intake.verify_batch_size must be positive");
        }
        if self.max_backlog == 0 {
            anyhow::bail!("intake.max_backlog must be positive");
        }
        Ok(())
    }
}

/// Gossip and sync tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent outgoing syncs
    pub permits: usize,
    /// Pause between two syncs with the same peer
    pub sync_interval_ms: u64,
    /// Upper bound for one complete sync exchange
    pub sync_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pause before redialing a failed peer
    pub reconnect_backoff_ms: u64,
    pub health_check_interval_ms: u64,
    /// Events per message
    pub max_events_per_message: usize,
    pub max_frame_size: usize,
    /// Fraction of peer weight that must report this node behind
    pub fallen_behind_threshold: Threshold,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            permits: 8,
            sync_interval_ms: 50,
            sync_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            reconnect_backoff_ms: 1_000,
            health_check_interval_ms: 200,
            max_events_per_message: 256,
            max_frame_size: hashgraph_net::framing::MAX_FRAME_SIZE,
            fallen_behind_threshold: Threshold::MAJORITY,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.permits == 0 {
            anyhow::bail!("sync.permits must be positive");
        }
        if self.sync_timeout_ms == 0 {
            anyhow::bail!("sync.sync_timeout_ms must be positive");
        }
        if self.max_events_per_message == 0 {
            anyhow::bail!("sync.max_events_per_message must be positive");
        }
        let t = self.fallen_behind_threshold;
        Threshold::new(t.numerator, t.denominator)?;
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Preconsensus event stream settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PcesConfig {
    /// Events written before a file is closed and a new one started
    pub preferred_file_event_count: u64,
}

impl Default for PcesConfig {
    fn default() -> Self {
        Self {
            preferred_file_event_count: 10_000,
        }
    }
}

impl PcesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.preferred_file_event_count == 0 {
            anyhow::bail!("pces.preferred_file_event_count must be positive");
        }
        Ok(())
    }
}

/// Persisted node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Signing key seed (deterministic recovery)
    pub keypair_seed: [u8; 32],
    pub node_id: NodeId,
}
