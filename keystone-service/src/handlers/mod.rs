//! Template-provided HTTP handlers
//!
//! The auth surface (`/auth/register`, `/auth/login`) ships with the
//! template; domain handlers come from the composed service through the
//! builder's route registration.

mod auth;

pub use auth::{auth_router, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
