//! End-to-end workflow tests against in-memory daemons.

mod backfill;
mod copy;
mod rebalance;
