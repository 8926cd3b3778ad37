/// REST client for the timer-rooms backend.
pub mod api_client;
/// Keeps the account session in step with the identity provider.
pub mod auth_reconciler;
/// Subscription status polling after checkout.
pub mod checkout_poller;
/// Identity provider and backend verification seams.
pub mod identity;
/// Bounded exponential backoff.
pub mod retry;
/// Room socket lifecycle and reconnection.
pub mod room_connection;
/// WebSocket implementation of the room transport.
pub mod ws_transport;
