//! petrel - declarative workflow orchestration over place/transition nets
//!
//! petrel compiles a submitted workflow document (named tasks, alternative
//! methods, typed data-flow links) into a colored place/transition net,
//! hands the compiled plan to a net-execution substrate, and then drives
//! the run through HTTP callbacks: the substrate notifies petrel as
//! transitions fire, petrel updates execution state and answers through
//! response links, and job services report status back the same way.
//!
//! ## Example
//!
//! ```yaml
//! name: sample-alignment
//! tasks:
//!   align:
//!     parallelBy: lanes
//!     methods:
//!       - name: bwa
//!         service: job
//!         serviceUrl: http://jobs/v1
//!         parameters:
//!           commandLine: [bwa, mem]
//! links:
//!   - source: input connector
//!     destination: align
//!     dataFlow:
//!       lanes: lanes
//!   - source: align
//!     destination: output connector
//!     dataFlow:
//!       bam: bams
//! inputs:
//!   lanes: [L1, L2]
//! ```

pub mod api;
pub mod clients;
pub mod color;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod graph;
pub mod net;
pub mod outbox;
pub mod store;

pub use error::{Error, Result};
