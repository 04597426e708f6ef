use crate::config::PipelineConfig;
use crate::store::DocumentStore;
use crate::types::{PipelineError, StoryCluster, StoryStatus};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SWEEP_INTERVAL_SECS: u64 = 120;

/// One status evaluation. `last_activity` is the story's `last_updated` as it
/// stood before the event being evaluated: the promotion windows measure time
/// since the story previously moved, not since this write.
pub struct Evaluation {
    pub prev_count: u32,
    pub new_count: u32,
    pub is_gaining: bool,
    pub last_activity: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// The transition table, applied in order; the first matching rule wins.
/// Returns the target status, which may equal the current one (no-op).
pub fn evaluate(
    config: &PipelineConfig,
    story: &StoryCluster,
    eval: &Evaluation,
) -> Option<StoryStatus> {
    let archive_age = Duration::hours(config.archive_age_hours);
    let breaking_window = Duration::minutes(config.breaking_window_minutes);

    debug!(
        story_id = %story.id,
        status = %story.status,
        prev_count = eval.prev_count,
        new_count = eval.new_count,
        is_gaining = eval.is_gaining,
        "Evaluating story status"
    );

    if eval.now - eval.last_activity > archive_age {
        return Some(StoryStatus::Archived);
    }
    if eval.new_count >= 3 && eval.now - story.first_seen < breaking_window {
        return Some(StoryStatus::Breaking);
    }
    if matches!(story.status, StoryStatus::Developing | StoryStatus::Verified)
        && eval.new_count >= 3
        && eval.is_gaining
        && eval.now - eval.last_activity < breaking_window
    {
        return Some(StoryStatus::Breaking);
    }
    if story.status == StoryStatus::Breaking
        && eval.now - eval.last_activity >= breaking_window
        && eval.new_count >= 3
    {
        return Some(StoryStatus::Verified);
    }
    if story.status == StoryStatus::Monitoring && eval.new_count >= 2 {
        return Some(StoryStatus::Developing);
    }
    if story.status == StoryStatus::Monitoring && eval.new_count == 1 {
        return Some(StoryStatus::Monitoring);
    }
    None
}

/// Apply a transition in place. Status changes move `last_updated` and are
/// recorded in the version history; entering BREAKING stamps
/// `breaking_detected_at` once.
pub fn apply_transition(story: &mut StoryCluster, to: StoryStatus, now: DateTime<Utc>) -> bool {
    if story.status == to {
        return false;
    }
    let from = story.status;
    if to == StoryStatus::Breaking && story.breaking_detected_at.is_none() {
        story.breaking_detected_at = Some(now);
    }
    story.status = to;
    story.last_updated = now;
    story.record_event(now, format!("status_changed:{}->{}", from, to));
    info!(story_id = %story.id, %from, %to, "Story status transition");
    true
}

/// Background sweep: every two minutes, re-run the time-based rules
/// (archival, BREAKING demotion to VERIFIED) over all non-archived stories.
/// Single-instance; conflicts with concurrent attach writes are skipped and
/// picked up on the next pass.
pub async fn run_status_sweep(
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Status sweep shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        match sweep_once(store.as_ref(), &config).await {
            Ok(transitions) if transitions > 0 => {
                info!("Status sweep applied {} transitions", transitions);
            }
            Ok(_) => {}
            Err(e) => error!("Status sweep failed: {}", e),
        }
    }
}

/// One sweep pass over every non-archived story. Returns how many
/// transitions were applied.
pub async fn sweep_once(
    store: &dyn DocumentStore,
    config: &PipelineConfig,
) -> crate::types::Result<usize> {
    let stories = store.active_stories().await?;

    let now = Utc::now();
    let mut transitions = 0usize;
    for mut story in stories {
        let eval = Evaluation {
            prev_count: story.unique_source_count,
            new_count: story.unique_source_count,
            is_gaining: false,
            last_activity: story.last_updated,
            now,
        };
        let Some(target) = evaluate(config, &story, &eval) else {
            continue;
        };
        if !apply_transition(&mut story, target, now) {
            continue;
        }
        match store.replace_story(&story).await {
            Ok(_) => transitions += 1,
            Err(PipelineError::Conflict { id }) => {
                debug!("Sweep lost a write race on {}, deferring to next pass", id);
            }
            Err(e) => warn!("Sweep failed to update story {}: {}", story.id, e),
        }
    }
    Ok(transitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    fn story_with(status: StoryStatus, first_seen_mins_ago: i64, last_activity_mins_ago: i64) -> (StoryCluster, DateTime<Utc>) {
        let now = Utc::now();
        let story = StoryCluster {
            id: "story_20250304_120000_abc123".to_string(),
            title: "Ceasefire talks continue in the region".to_string(),
            fingerprint: "ceasefire_gaza_talks".to_string(),
            category: Category::World,
            source_articles: vec![],
            unique_source_count: 1,
            verification_level: 1,
            status,
            first_seen: now - Duration::minutes(first_seen_mins_ago),
            last_updated: now - Duration::minutes(last_activity_mins_ago),
            breaking_detected_at: None,
            summary: None,
            version_history: vec![],
            version: 1,
        };
        (story, now)
    }

    fn eval(prev: u32, new: u32, gaining: bool, story: &StoryCluster, now: DateTime<Utc>) -> Evaluation {
        Evaluation {
            prev_count: prev,
            new_count: new,
            is_gaining: gaining,
            last_activity: story.last_updated,
            now,
        }
    }

    #[test]
    fn stale_story_archives_before_anything_else() {
        let (story, now) = story_with(StoryStatus::Breaking, 30 * 60, 25 * 60);
        let e = eval(3, 4, true, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Archived));
    }

    #[test]
    fn three_sources_inside_window_is_breaking() {
        let (story, now) = story_with(StoryStatus::Developing, 10, 5);
        let e = eval(2, 3, true, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Breaking));
    }

    #[test]
    fn gaining_developing_story_repromotes_after_window() {
        // First seen 2h ago, so the fresh-story rule is out; the re-promotion
        // rule needs a gain within the activity window.
        let (story, now) = story_with(StoryStatus::Developing, 120, 10);
        let e = eval(3, 4, true, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Breaking));

        let stale = eval(3, 4, true, &story, now + Duration::minutes(60));
        let mut stale_eval = stale;
        stale_eval.last_activity = now - Duration::minutes(40);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &stale_eval), None);
    }

    #[test]
    fn quiet_breaking_story_settles_to_verified() {
        let (story, now) = story_with(StoryStatus::Breaking, 120, 45);
        let e = eval(3, 3, false, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Verified));
    }

    #[test]
    fn second_source_develops_a_monitoring_story() {
        let (story, now) = story_with(StoryStatus::Monitoring, 120, 40);
        let e = eval(1, 2, true, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Developing));
    }

    #[test]
    fn single_source_story_stays_monitoring() {
        let (story, now) = story_with(StoryStatus::Monitoring, 50, 40);
        let e = eval(1, 1, false, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), Some(StoryStatus::Monitoring));
    }

    #[test]
    fn verified_story_without_gain_stays_put() {
        let (story, now) = story_with(StoryStatus::Verified, 120, 10);
        let e = eval(4, 4, false, &story, now);
        assert_eq!(evaluate(&PipelineConfig::default(), &story, &e), None);
    }

    #[test]
    fn transition_application_stamps_breaking_detection_once() {
        let (mut story, now) = story_with(StoryStatus::Developing, 10, 5);
        assert!(apply_transition(&mut story, StoryStatus::Breaking, now));
        let first_stamp = story.breaking_detected_at;
        assert!(first_stamp.is_some());
        assert_eq!(story.last_updated, now);

        let later = now + Duration::minutes(45);
        assert!(apply_transition(&mut story, StoryStatus::Verified, later));
        assert!(apply_transition(&mut story, StoryStatus::Breaking, later + Duration::minutes(1)));
        assert_eq!(story.breaking_detected_at, first_stamp);
        assert_eq!(story.version_history.len(), 3);
    }

    #[test]
    fn reapplying_the_same_status_is_a_noop() {
        let (mut story, now) = story_with(StoryStatus::Monitoring, 50, 40);
        let before = story.last_updated;
        assert!(!apply_transition(&mut story, StoryStatus::Monitoring, now));
        assert_eq!(story.last_updated, before);
        assert!(story.version_history.is_empty());
    }
}
