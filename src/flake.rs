//! The ID-generation façade.
//!
//! [`EasyFlake`] packs a scaled timestamp, a node ID and an intra-tick
//! sequence value into one 64-bit identifier, Snowflake style. The node-ID
//! section comes either from a fixed integer or from a live
//! [`NodeIdPool`] lease.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::clock::{TimeScale, TimeSource};
use crate::node::NodeIdPool;
use crate::sequence::TimeSequenceProvider;
use crate::{Error, Result};

/// Default epoch, 2023-02-08T12:24:00Z as Unix seconds.
pub const DEFAULT_EPOCH: f64 = 1_675_859_040.0;

const ID_BITS: u32 = 64;
const DEFAULT_NODE_ID_BITS: u32 = 8;
const DEFAULT_SEQUENCE_BITS: u32 = 8;
const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Where the node-ID section of generated IDs comes from.
#[derive(Debug, Clone)]
pub enum NodeIdSource {
    /// A fixed node ID, chosen by the operator.
    Fixed(u64),
    /// The current lease of a [`NodeIdPool`].
    Pool(NodeIdPool),
}

impl NodeIdSource {
    fn get(&self) -> Result<u64> {
        match self {
            Self::Fixed(node_id) => Ok(*node_id),
            Self::Pool(pool) => pool.get(),
        }
    }
}

impl From<u64> for NodeIdSource {
    fn from(node_id: u64) -> Self {
        Self::Fixed(node_id)
    }
}

impl From<NodeIdPool> for NodeIdSource {
    fn from(pool: NodeIdPool) -> Self {
        Self::Pool(pool)
    }
}

/// Generator of 64-bit, roughly time-sortable unique IDs.
///
/// IDs are laid out MSB to LSB as `[timestamp][node_id][sequence]`; the
/// section widths are fixed at construction and validated against a
/// 64-bit budget.
///
/// # Example
///
/// ```
/// use easyflake::EasyFlake;
///
/// let flake = EasyFlake::new(3u64)?;
/// let id = flake.next_id()?;
/// assert_ne!(id, flake.next_id()?);
/// # Ok::<(), easyflake::Error>(())
/// ```
#[derive(Debug)]
pub struct EasyFlake {
    node: NodeIdSource,
    node_id_bits: u32,
    sequence_bits: u32,
    provider: TimeSequenceProvider,
}

impl EasyFlake {
    /// Generator with the default layout: 8 node-ID bits, 8 sequence
    /// bits, millisecond timestamps since [`DEFAULT_EPOCH`].
    ///
    /// # Errors
    ///
    /// See [`EasyFlakeBuilder::build`].
    pub fn new(node: impl Into<NodeIdSource>) -> Result<Self> {
        Self::builder().build(node)
    }

    /// Start configuring a generator.
    #[must_use]
    pub fn builder() -> EasyFlakeBuilder {
        EasyFlakeBuilder::new()
    }

    /// Generate the next ID.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Timeout`] and [`Error::Connection`] from a
    /// pool-backed node-ID source; a fixed source never fails.
    pub fn next_id(&self) -> Result<u64> {
        let seq = self.provider.next();
        let node_id = self.node.get()?;
        #[allow(clippy::cast_sign_loss)]
        let timestamp = seq.timestamp as u64;
        Ok((timestamp << (self.sequence_bits + self.node_id_bits))
            | (node_id << self.sequence_bits)
            | seq.value)
    }

    /// Node ID the next generated ID will carry.
    ///
    /// # Errors
    ///
    /// Same conditions as [`next_id`](Self::next_id) for a pool-backed
    /// source.
    pub fn node_id(&self) -> Result<u64> {
        self.node.get()
    }

    /// Split an ID into its `(timestamp, node_id, sequence)` sections.
    #[must_use]
    pub const fn decompose(&self, id: u64) -> (u64, u64, u64) {
        let sequence_mask = (1u64 << self.sequence_bits) - 1;
        let node_mask = (1u64 << self.node_id_bits) - 1;
        (
            id >> (self.sequence_bits + self.node_id_bits),
            (id >> self.sequence_bits) & node_mask,
            id & sequence_mask,
        )
    }

    /// Width of the node-ID section.
    #[must_use]
    pub const fn node_id_bits(&self) -> u32 {
        self.node_id_bits
    }

    /// Width of the sequence section.
    #[must_use]
    pub const fn sequence_bits(&self) -> u32 {
        self.sequence_bits
    }
}

/// Builder for [`EasyFlake`].
pub struct EasyFlakeBuilder {
    node_id_bits: u32,
    sequence_bits: u32,
    epoch: f64,
    time_scale: u32,
    time_source: Option<Arc<dyn TimeSource>>,
}

impl std::fmt::Debug for EasyFlakeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EasyFlakeBuilder")
            .field("node_id_bits", &self.node_id_bits)
            .field("sequence_bits", &self.sequence_bits)
            .field("epoch", &self.epoch)
            .field("time_scale", &self.time_scale)
            .finish_non_exhaustive()
    }
}

impl Default for EasyFlakeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EasyFlakeBuilder {
    /// Builder initialised with the default layout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node_id_bits: DEFAULT_NODE_ID_BITS,
            sequence_bits: DEFAULT_SEQUENCE_BITS,
            epoch: DEFAULT_EPOCH,
            time_scale: TimeScale::Milli.digits(),
            time_source: None,
        }
    }

    /// Width of the node-ID section.
    #[must_use]
    pub const fn node_id_bits(mut self, bits: u32) -> Self {
        self.node_id_bits = bits;
        self
    }

    /// Width of the sequence section.
    #[must_use]
    pub const fn sequence_bits(mut self, bits: u32) -> Self {
        self.sequence_bits = bits;
        self
    }

    /// Reference timestamp (fractional Unix seconds) for the timestamp
    /// section.
    #[must_use]
    pub const fn epoch(mut self, epoch: f64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Timestamp resolution; see [`TimeScale`].
    #[must_use]
    pub fn time_scale(mut self, scale: impl Into<u32>) -> Self {
        self.time_scale = scale.into();
        self
    }

    /// Read time from a custom [`TimeSource`].
    #[must_use]
    pub fn time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Build a generator drawing node IDs from `node`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a section width is zero, a
    /// fixed node ID does not fit its section, or the timestamp section
    /// cannot cover one year within the 64-bit budget. A budget that runs
    /// out within three years only logs a warning.
    pub fn build(self, node: impl Into<NodeIdSource>) -> Result<EasyFlake> {
        let node = node.into();

        let max_node_id = Self::node_id_ceiling(self.node_id_bits)? - 1;
        if let NodeIdSource::Fixed(node_id) = node {
            if node_id > max_node_id {
                return Err(Error::InvalidConfig(format!(
                    "node_id is required to be >=0 and <={max_node_id}, but {node_id} is given"
                )));
            }
        }

        let provider = match self.time_source {
            Some(source) => TimeSequenceProvider::with_time_source(
                self.sequence_bits,
                self.epoch,
                self.time_scale,
                source,
            )?,
            None => TimeSequenceProvider::new(self.sequence_bits, self.epoch, self.time_scale)?,
        };

        let flake = EasyFlake {
            node,
            node_id_bits: self.node_id_bits,
            sequence_bits: self.sequence_bits,
            provider,
        };
        flake.validate_timestamp_budget()?;
        Ok(flake)
    }

    /// Build a generator with a random fixed node ID within the node-ID
    /// section.
    ///
    /// Collisions between nodes picking the same value are possible;
    /// prefer a pool or an assigned ID where uniqueness matters.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_with_random_node_id(self) -> Result<EasyFlake> {
        let ceiling = Self::node_id_ceiling(self.node_id_bits)?;
        let node_id = rand::thread_rng().gen_range(0..ceiling);
        self.build(node_id)
    }

    fn node_id_ceiling(bits: u32) -> Result<u64> {
        if (1..=62).contains(&bits) {
            Ok(1u64 << bits)
        } else {
            Err(Error::InvalidConfig(format!(
                "node_id_bits must be between 1 and 62, but {bits} is given"
            )))
        }
    }
}

impl EasyFlake {
    fn validate_timestamp_budget(&self) -> Result<()> {
        if !self.fits_within(YEAR) {
            return Err(Error::InvalidConfig(
                "unable to count timestamp within a year".into(),
            ));
        }
        if !self.fits_within(3 * YEAR) {
            warn!("unable to count timestamp within 3 years");
        }
        Ok(())
    }

    fn fits_within(&self, delta: Duration) -> bool {
        let timestamp_bits = self.provider.get_required_bits(delta);
        timestamp_bits + self.node_id_bits + self.sequence_bits < ID_BITS
    }
}
