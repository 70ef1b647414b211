/*
 * RPG Scribe - Rust Edition
 * Copyright (c) 2024 RPG Scribe Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Structured error types for component boundaries.
//!
//! Most call sites propagate with `anyhow::Result` (see `main.rs` and the
//! CLI boundary); these `thiserror` enums exist only where a caller needs
//! to match on a specific failure kind (e.g. the resilience kit's circuit
//! breaker).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError<E> {
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Operation(#[from] E),
}

#[derive(Error, Debug)]
pub enum SegmenterError {
    #[error("audio source error: {0}")]
    Source(String),
    #[error("vad classification failed: {0}")]
    Vad(String),
}

#[derive(Error, Debug)]
pub enum TranscriberError {
    #[error("stt request failed: {0}")]
    Request(String),
    #[error("stt request timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum SummarizerError {
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm request timed out")]
    Timeout,
    #[error("no active session")]
    NoActiveSession,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}
