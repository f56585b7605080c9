//! Push payload to notification mapping.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::NotificationDefaults;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl NotificationAction {
  fn new(action: &str, title: &str, icon: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: icon.to_string(),
    }
  }
}

/// What the host shows to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub actions: Vec<NotificationAction>,
  /// The delivered payload, kept for action routing
  pub data: Value,
}

/// Decode a push payload. Anything that is not a JSON object yields an empty
/// payload so the generic template still renders.
pub fn parse_payload(raw: Option<&[u8]>) -> Value {
  let Some(raw) = raw else {
    return Value::Object(Map::new());
  };
  match serde_json::from_slice::<Value>(raw) {
    Ok(value @ Value::Object(_)) => value,
    Ok(_) => {
      warn!("push payload is not an object, using generic template");
      Value::Object(Map::new())
    }
    Err(e) => {
      warn!(error = %e, "failed to parse push payload, using generic template");
      Value::Object(Map::new())
    }
  }
}

fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
  payload.get(name).and_then(Value::as_str)
}

/// Map a payload's `type` to a template; unknown types use the generic one
/// built from whatever fields are present over the configured defaults.
pub fn render_notification(defaults: &NotificationDefaults, payload: &Value) -> Notification {
  let mut notification = Notification {
    title: field(payload, "title").unwrap_or(&defaults.title).to_string(),
    body: field(payload, "body").unwrap_or(&defaults.body).to_string(),
    icon: field(payload, "icon").unwrap_or(&defaults.icon).to_string(),
    badge: field(payload, "badge").unwrap_or(&defaults.badge).to_string(),
    tag: field(payload, "tag").unwrap_or(&defaults.tag).to_string(),
    actions: Vec::new(),
    data: payload.clone(),
  };

  match field(payload, "type") {
    Some("appointment-reminder") => {
      let doctor = field(payload, "doctor").unwrap_or("your doctor");
      let time = field(payload, "time").unwrap_or("the scheduled time");
      notification.title = "Appointment Reminder".to_string();
      notification.body = format!("Your appointment with {} is tomorrow at {}", doctor, time);
      notification.actions = vec![
        NotificationAction::new("confirm", "Confirm", "/assets/icons/confirm.png"),
        NotificationAction::new("reschedule", "Reschedule", "/assets/icons/reschedule.png"),
      ];
    }
    Some("medicine-reminder") => {
      let medicine = field(payload, "medicine").unwrap_or("medicine");
      notification.title = "Medicine Reminder".to_string();
      notification.body = format!("Time to take your {}", medicine);
      notification.actions = vec![
        NotificationAction::new("taken", "Taken", "/assets/icons/check.png"),
        NotificationAction::new("snooze", "Remind Later", "/assets/icons/snooze.png"),
      ];
    }
    _ => {}
  }

  notification
}
