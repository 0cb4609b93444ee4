//! Shared Per-Display Context
//!
//! Display, user and environment state owned by the session controller and
//! broadcast to conversations as needed. Conversations read it through the
//! controller; nothing else mutates it.

use std::collections::HashMap;

use crate::channel::protocol::SetupDetails;
use crate::config::SessionConfig;

/// Per-display context for one session controller instance.
///
/// Split into object-lifetime fields (display identity) and per-attempt
/// fields (selections, environment) that `reset` clears between logins.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Display name, e.g. ":0"
    pub display_name: Option<String>,
    /// Host the display is attached to; local displays leave this unset
    pub display_hostname: Option<String>,
    /// Console device backing the display
    pub display_device: Option<String>,
    /// Seat identifier
    pub display_seat_id: Option<String>,
    /// X11 authority file for the display
    pub display_x11_authority_file: Option<String>,
    /// Whether the display is local to this machine
    pub display_is_local: bool,
    /// Whether this is the machine's initial display
    pub display_is_initial: bool,
    /// Session type ("x11", "wayland"); falls back to configuration
    pub session_type: Option<String>,

    selected_user: Option<String>,
    selected_session: Option<String>,
    selected_language: Option<String>,
    selected_program: Option<String>,
    user_x11_authority_file: Option<String>,
    environment: HashMap<String, String>,
}

impl SessionContext {
    /// Fresh context for a local display
    pub fn new() -> Self {
        Self {
            display_is_local: true,
            ..Default::default()
        }
    }

    /// Hostname forwarded to workers; remote displays carry their own,
    /// local displays report the machine's
    pub fn effective_hostname(&self) -> String {
        if let Some(hostname) = &self.display_hostname {
            return hostname.clone();
        }

        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_default()
    }

    /// Display context in wire form for a setup verb
    pub fn setup_details(&self) -> SetupDetails {
        SetupDetails {
            display_name: self.display_name.clone().unwrap_or_default(),
            hostname: self.effective_hostname(),
            device: self.display_device.clone().unwrap_or_default(),
            seat_id: self.display_seat_id.clone().unwrap_or_default(),
            x11_authority_file: self
                .display_x11_authority_file
                .clone()
                .unwrap_or_default(),
            is_local: self.display_is_local,
            is_initial: self.display_is_initial,
        }
    }

    /// The user selected for this attempt, if any
    pub fn selected_user(&self) -> Option<&str> {
        self.selected_user.as_deref()
    }

    /// Select the user to log in
    pub fn select_user(&mut self, username: impl Into<String>) {
        self.selected_user = Some(username.into());
    }

    /// Select the session to run
    pub fn select_session(&mut self, name: impl Into<String>) {
        self.selected_session = Some(name.into());
    }

    /// Select the language to use
    pub fn select_language(&mut self, name: impl Into<String>) {
        self.selected_language = Some(name.into());
    }

    /// Select an explicit program instead of the configured session command
    pub fn select_program(&mut self, command: impl Into<String>) {
        self.selected_program = Some(command.into());
    }

    /// X11 authority file belonging to the logged-in user
    pub fn set_user_x11_authority_file(&mut self, path: impl Into<String>) {
        self.user_x11_authority_file = Some(path.into());
    }

    /// Session name in effect: the selection or the configured default
    pub fn session_name<'a>(&'a self, config: &'a SessionConfig) -> &'a str {
        self.selected_session
            .as_deref()
            .unwrap_or(&config.default_session)
    }

    /// Language in effect: the selection or the configured fallback
    pub fn language_name<'a>(&'a self, config: &'a SessionConfig) -> &'a str {
        self.selected_language
            .as_deref()
            .unwrap_or(&config.fallback_language)
    }

    /// Session type in effect
    pub fn session_type<'a>(&'a self, config: &'a SessionConfig) -> &'a str {
        self.session_type.as_deref().unwrap_or(&config.session_type)
    }

    /// Command to run as the user session: the explicit selection or the
    /// configured session command
    pub fn session_command<'a>(&'a self, config: &'a SessionConfig) -> &'a str {
        self.selected_program
            .as_deref()
            .unwrap_or(&config.session_command)
    }

    /// Record one environment override for the session
    pub fn set_environment_variable(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.environment.insert(key.into(), value.into());
    }

    /// The accumulated environment overrides
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Compute the full session environment sent ahead of the session
    /// program: the derived well-known variables first, then the caller's
    /// overrides on top.
    pub fn session_environment(&self, config: &SessionConfig) -> Vec<(String, String)> {
        let session_name = self.session_name(config).to_string();
        let language = self.language_name(config).to_string();

        let mut environment = vec![
            ("DESKTOP_SESSION".to_string(), session_name.clone()),
            ("XDG_SESSION_DESKTOP".to_string(), session_name),
            (
                "XDG_SESSION_TYPE".to_string(),
                self.session_type(config).to_string(),
            ),
            ("LANG".to_string(), language),
        ];

        if let Some(display_name) = &self.display_name {
            environment.push(("DISPLAY".to_string(), display_name.clone()));
        }
        if let Some(authority) = &self.user_x11_authority_file {
            environment.push(("XAUTHORITY".to_string(), authority.clone()));
        }

        for (key, value) in &self.environment {
            environment.push((key.clone(), value.clone()));
        }

        environment
    }

    /// Clear the per-attempt scope: selections, environment, user authority.
    /// Display identity survives, it belongs to the controller's lifetime.
    pub fn reset(&mut self) {
        self.selected_user = None;
        self.selected_session = None;
        self.selected_language = None;
        self.selected_program = None;
        self.user_x11_authority_file = None;
        self.environment.clear();
    }
}
