//! Consolidated test modules.
//!
//! End-to-end tests that drive the full router: HTTP in, execution unit,
//! session store, HTTP out.
