//! End-to-end tests for the relay surface, driven through the scripted
//! messenger: intake and the fast path, the two worker pools, batch
//! orchestration, and the admin surface.
