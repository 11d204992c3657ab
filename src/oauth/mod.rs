//! OAuth 2.0 authorization code flow.
//!
//! 1. Browser opens `/auth/{provider}` in a popup
//! 2. [`AuthFlow::begin_auth`] issues a CSRF state and redirects to consent
//! 3. Provider redirects to `/auth/{provider}/callback`
//! 4. [`AuthFlow::handle_callback`] validates the state, exchanges the code,
//!    enriches and persists the record
//! 5. The popup page posts a [`PopupMessage`] to its opener and closes

mod flow;
mod popup;
mod state_store;

pub use flow::{AuthFlow, CallbackQuery};
pub use popup::PopupMessage;
pub use state_store::{run_state_cleanup, StateEntry, StateManager};
