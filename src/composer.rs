//! Event composition: buttons, triggers and the canonical [`Event`].

use crate::config::{ButtonSettings, DEFAULT_TEXT_SOURCE, NO_TEXT_SOURCE};
use crate::error::{SlError, SlResult};
use crate::mapping::{ComputedValue, MappingSet, SourceLocator};
use crate::model::{Event, EventField, FieldFailure, FieldValue, Guid};
use crate::resolver::{ResolutionContext, resolve};

pub const LOG_ON: &str = "Log on";
pub const LOG_OFF: &str = "Log off";
pub const EVENT: &str = "Event";
pub const SVP: &str = "SVP";
pub const NEW_DAY: &str = "New Day";
pub const HOURLY_KP: &str = "Hourly KP Log";

const HOURLY_KP_PREFIX: &str = "Current KP:";

// ---------------------------------------------------------------------------
// Buttons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonSpec {
    pub id: String,
    pub event_type: String,
    pub event_text: String,
    pub text_source: Option<String>,
    pub include_folder_refs: bool,
    /// Monitored folders written even when folder references are off or the
    /// folder is marked skip.
    pub force_folders: Vec<String>,
    pub row_color: Option<String>,
    pub builtin: bool,
}

impl ButtonSpec {
    fn builtin(id: &str, event_text: impl Into<String>) -> Self {
        Self {
            id: id.to_owned(),
            event_type: id.to_owned(),
            event_text: event_text.into(),
            text_source: Some(DEFAULT_TEXT_SOURCE.to_owned()),
            include_folder_refs: true,
            force_folders: Vec::new(),
            row_color: None,
            builtin: true,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &ButtonSettings) -> Self {
        let id = settings.id.trim().to_owned();
        Self {
            event_type: settings.event_type.clone().unwrap_or_else(|| id.clone()),
            event_text: settings
                .event_text
                .clone()
                .unwrap_or_else(|| format!("{id} Triggered")),
            text_source: settings
                .text_source
                .clone()
                .filter(|source| source != NO_TEXT_SOURCE),
            include_folder_refs: settings.include_folder_refs,
            force_folders: Vec::new(),
            row_color: settings.row_color.clone(),
            builtin: false,
            id,
        }
    }

    /// Trigger for one press. `text` replaces the configured event text.
    #[must_use]
    pub fn trigger(&self, text: Option<String>) -> Trigger {
        Trigger {
            button_id: self.id.clone(),
            event_type: self.event_type.clone(),
            event_text: text.unwrap_or_else(|| self.event_text.clone()),
            text_source: self.text_source.clone(),
            include_folder_refs: self.include_folder_refs,
            force_folders: self.force_folders.clone(),
            carried_guid: None,
            row_color: self.row_color.clone(),
        }
    }
}

#[must_use]
pub fn builtin_buttons() -> Vec<ButtonSpec> {
    let mut event = ButtonSpec::builtin(EVENT, "");
    event.include_folder_refs = false;
    let mut svp = ButtonSpec::builtin(SVP, "SVP applied");
    svp.force_folders.push(SVP.to_owned());
    vec![
        ButtonSpec::builtin(LOG_ON, format!("{LOG_ON} event occurred")),
        ButtonSpec::builtin(LOG_OFF, format!("{LOG_OFF} event occurred")),
        event,
        svp,
        ButtonSpec::builtin(NEW_DAY, NEW_DAY),
        ButtonSpec::builtin(HOURLY_KP, ""),
    ]
}

// ---------------------------------------------------------------------------
// Trigger / composition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub button_id: String,
    pub event_type: String,
    pub event_text: String,
    pub text_source: Option<String>,
    pub include_folder_refs: bool,
    pub force_folders: Vec<String>,
    /// Set only on repair flows that re-log an existing event.
    pub carried_guid: Option<Guid>,
    pub row_color: Option<String>,
}

pub struct EventComposer<'m> {
    mappings: &'m MappingSet,
}

impl<'m> EventComposer<'m> {
    #[must_use]
    pub const fn new(mappings: &'m MappingSet) -> Self {
        Self { mappings }
    }

    /// Build an event stamped with `ctx.now`.
    ///
    /// Field-local failures are recorded on the event and the field is left
    /// absent; any other resolution error aborts composition.
    pub fn compose(&self, trigger: &Trigger, ctx: &ResolutionContext<'_>) -> SlResult<Event> {
        for forced in &trigger.force_folders {
            let configured = self.mappings.iter().any(|(_, locator)| {
                matches!(
                    locator,
                    SourceLocator::Computed(ComputedValue::LatestFile(folder))
                        if folder.eq_ignore_ascii_case(forced)
                )
            });
            if !configured {
                return Err(SlError::Config(format!(
                    "button `{}` needs monitored folder `{forced}`",
                    trigger.button_id
                )));
            }
        }

        let mut fields = Vec::with_capacity(self.mappings.len());
        let mut failures = Vec::new();

        for (mapping, locator) in self.mappings.iter() {
            let evaluate = match locator {
                SourceLocator::Computed(ComputedValue::LatestFile(folder)) => {
                    trigger
                        .force_folders
                        .iter()
                        .any(|forced| forced.eq_ignore_ascii_case(folder))
                        || (trigger.include_folder_refs && !mapping.skip)
                }
                SourceLocator::Column(_) => !mapping.skip && ctx.text_source_for(mapping).is_some(),
                _ => !mapping.skip,
            };
            if !evaluate {
                continue;
            }

            let value = match resolve(mapping, locator, ctx) {
                Ok(value) => value,
                Err(error) if error.is_field_local() => {
                    tracing::warn!(
                        button = %trigger.button_id,
                        field = %mapping.field,
                        code = error.error_code(),
                        error = %error,
                        "field left empty"
                    );
                    failures.push(FieldFailure {
                        field: mapping.field.clone(),
                        error_code: error.error_code().to_owned(),
                        message: error.to_string(),
                    });
                    FieldValue::Absent
                }
                Err(error) => return Err(error),
            };
            fields.push(EventField {
                name: mapping.field.trim().to_owned(),
                value,
            });
        }

        Ok(Event {
            guid: trigger.carried_guid.unwrap_or_else(Guid::new_random),
            log_timestamp: ctx.now,
            event_type: trigger.event_type.clone(),
            event_text: trigger.event_text.clone(),
            fields,
            row_color: trigger.row_color.clone(),
            failures,
        })
    }
}

// ---------------------------------------------------------------------------
// Hourly KP
// ---------------------------------------------------------------------------

#[must_use]
pub fn hourly_kp_text(current: f64, previous: Option<f64>) -> String {
    match previous {
        Some(previous) => format!(
            "{HOURLY_KP_PREFIX} {current:.3} | Progress last hour: {:+.3} km",
            current - previous
        ),
        None => format!("{HOURLY_KP_PREFIX} {current:.3} | First hourly log"),
    }
}

/// KP recorded in an hourly event text, if `text` is one.
#[must_use]
pub fn parse_hourly_kp(text: &str) -> Option<f64> {
    let rest = text.trim().strip_prefix(HOURLY_KP_PREFIX)?;
    let value = rest.split('|').next()?.trim();
    value.parse().ok()
}
