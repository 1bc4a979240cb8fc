//! Applications the scenarios drive.
//!
//! Counters are u64 little-endian values; every handler here is
//! deterministic in its message and reads, as the contract demands.

use std::sync::Arc;

use bytes::Bytes;
use beehive_core::{AppOptions, Cell, Envelope, MappedCells};
use beehive_runtime::{App, Handler, HandlerError, MapCtx, RcvCtx};

/// Decodes a counter value (0 if absent or malformed).
#[must_use]
pub fn counter_value(value: Option<&Bytes>) -> u64 {
    value.map_or(0, |v| {
        if v.len() == 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(v);
            u64::from_le_bytes(bytes)
        } else {
            0
        }
    })
}

fn bump(ctx: &mut RcvCtx<'_>, dict: &str, key: Bytes) {
    let current = counter_value(ctx.dict(dict).get(key.clone()).as_ref());
    ctx.dict(dict).put(key, (current + 1).to_le_bytes().to_vec());
}

/// `hello`: one cell per payload; increments its counter.
pub struct CounterHandler;

impl Handler for CounterHandler {
    fn map(&self, env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
        Some(MappedCells::single(Cell::new("hello", env.payload.clone())))
    }

    fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
        bump(ctx, "hello", env.payload.clone());
        Ok(())
    }
}

/// `pair`: maps two cells named in the payload as `k1,k2`; used to force
/// split rejections.
pub struct PairHandler;

impl Handler for PairHandler {
    fn map(&self, env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
        let payload = String::from_utf8_lossy(&env.payload);
        let (k1, k2) = payload.split_once(',')?;
        MappedCells::from_cells([
            Cell::new("hello", k1.as_bytes().to_vec()),
            Cell::new("hello", k2.as_bytes().to_vec()),
        ])
    }

    fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
        let payload = String::from_utf8_lossy(&env.payload).into_owned();
        let Some((k1, k2)) = payload.split_once(',') else {
            return Err(HandlerError::new("malformed pair payload"));
        };
        bump(ctx, "hello", Bytes::from(k1.as_bytes().to_vec()));
        bump(ctx, "hello", Bytes::from(k2.as_bytes().to_vec()));
        Ok(())
    }
}

/// `triple`: always maps the three grid cells, so one bee owns them all.
pub struct TripleHandler;

/// The grid cells the triple handler owns.
#[must_use]
pub fn grid_cells() -> Vec<Cell> {
    vec![
        Cell::new("grid", &b"c1"[..]),
        Cell::new("grid", &b"c2"[..]),
        Cell::new("grid", &b"c3"[..]),
    ]
}

impl Handler for TripleHandler {
    fn map(&self, _env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
        MappedCells::from_cells(grid_cells())
    }

    fn rcv(&self, _env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
        for cell in grid_cells() {
            bump(ctx, "grid", cell.key);
        }
        Ok(())
    }
}

/// `grid-one`: maps one grid cell named by the payload.
pub struct GridOneHandler;

impl Handler for GridOneHandler {
    fn map(&self, env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
        Some(MappedCells::single(Cell::new("grid", env.payload.clone())))
    }

    fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
        bump(ctx, "grid", env.payload.clone());
        Ok(())
    }
}

/// `chain`: increments a shared total and re-emits itself with a
/// decremented hop count, exercising the emit path end to end.
pub struct ChainHandler;

impl Handler for ChainHandler {
    fn map(&self, _env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
        Some(MappedCells::single(Cell::new("chain", &b"total"[..])))
    }

    fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
        bump(ctx, "chain", Bytes::from(&b"total"[..]));
        let hops = env.payload.first().copied().unwrap_or(0);
        if hops > 0 {
            ctx.emit("chain", vec![hops - 1]);
        }
        Ok(())
    }
}

/// The standard test application: all handlers above under one app.
#[must_use]
pub fn test_app(options: AppOptions) -> App {
    App::new("scenarios", options)
        .handle("hello", Arc::new(CounterHandler))
        .handle("pair", Arc::new(PairHandler))
        .handle("triple", Arc::new(TripleHandler))
        .handle("grid-one", Arc::new(GridOneHandler))
        .handle("chain", Arc::new(ChainHandler))
}
