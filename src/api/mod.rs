// =============================================================================
// API — HTTP façade consumed by the dashboard
// =============================================================================

pub mod rest;
