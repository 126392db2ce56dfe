//! mediavault: self-hosted media archiver powered by yt-dlp.
//!
//! The core is the run pipeline: discovery turns configured playlists into
//! new work, a durable source-partitioned job queue carries it, per-source
//! workers execute a hardened multi-profile attempt plan, and finished
//! artifacts are tagged and filed into the library. A search-resolution
//! service feeds the same queue from free-form track/album requests, and a
//! background enrichment worker upgrades music files with canonical
//! MusicBrainz/AcoustID metadata. The HTTP surface, Telegram notifications,
//! and the CLI are thin collaborators around that core.

pub mod config;
pub mod db;
pub mod delivery;
pub mod discovery;
pub mod enrich;
pub mod executor;
pub mod filename;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod paths;
pub mod platform;
pub mod providers;
pub mod run;
pub mod scheduler;
pub mod search;
pub mod search_adapters;
pub mod search_scoring;
pub mod server;
pub mod status;
pub mod tagger;
pub mod tools;
pub mod transcode;
pub mod urls;
pub mod worker;
pub mod ytdlp;
