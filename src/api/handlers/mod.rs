pub mod auth;
pub mod health;
pub mod me;
pub mod principal;
pub mod roles;
pub mod users;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::identity::Listing;

/// 200 with the items, or 204 when there are none.
pub(crate) fn listing_response<T: Serialize>(listing: Listing<T>) -> Response {
    match listing {
        Listing::Empty => StatusCode::NO_CONTENT.into_response(),
        Listing::Items(items) => Json(items).into_response(),
    }
}
