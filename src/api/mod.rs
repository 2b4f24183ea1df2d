//! HTTP API Module
//!
//! Provides the admin REST API for reservations and cluster management.

mod http;

pub use http::{
    ActionResponse, AppState, ErrorResponse, HealthResponse, HttpServer, ReservationAction,
    ReservationRequest, SubmitResponse,
};
