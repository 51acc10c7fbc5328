//! Thumbs-up rule over pixel-projected hand landmarks.
//!
//! Margins scale with the hand's vertical span so the same pose is accepted
//! whether the hand fills the frame or sits far from the camera.

use tracing::warn;

use crate::{
    error::ObservationError,
    landmarks::{FINGER_JOINTS, HandObservation, INDEX_TIP, THUMB_IP, THUMB_MCP, THUMB_TIP, WRIST},
};

const LIFT_SPAN_FACTOR: f32 = 0.12;
const CURL_SPAN_FACTOR: f32 = 0.08;
const TIP_TO_IP_LIFT: f32 = 0.4;
const TIP_TO_MCP_LIFT: f32 = 0.6;
const FINGER_CURL: f32 = 0.6;
const VERTICAL_RATIO: f32 = 0.5;

/// Geometric classifier for a raised thumb with the other fingers curled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbsUpRule {
    /// Minimum lift margin in pixels, used when the hand is small.
    pub lift_margin_px: f32,
    /// Minimum curl margin in pixels, used when the hand is small.
    pub curl_margin_px: f32,
}

impl Default for ThumbsUpRule {
    fn default() -> Self {
        Self {
            lift_margin_px: 10.0,
            curl_margin_px: 6.0,
        }
    }
}

impl ThumbsUpRule {
    pub fn new(lift_margin_px: f32, curl_margin_px: f32) -> Self {
        Self {
            lift_margin_px,
            curl_margin_px,
        }
    }

    /// Returns `true` when `hand` shows a thumbs-up. Malformed observations are
    /// logged and count as a miss.
    pub fn classify(&self, hand: &HandObservation, frame_height: u32, frame_width: u32) -> bool {
        match self.evaluate(hand, frame_height, frame_width) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!("Skipping malformed hand observation: {err}");
                false
            }
        }
    }

    pub fn evaluate(
        &self,
        hand: &HandObservation,
        frame_height: u32,
        frame_width: u32,
    ) -> Result<bool, ObservationError> {
        hand.validate()?;
        let px = hand.to_pixels(frame_width, frame_height);
        let y = |i: usize| px[i].1;
        let x = |i: usize| px[i].0;

        let (top, bottom) = px
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &(_, py)| {
                (lo.min(py), hi.max(py))
            });
        let span = (bottom - top).max(1.0);
        let lift = self.lift_margin_px.max(span * LIFT_SPAN_FACTOR);
        let curl = self.curl_margin_px.max(span * CURL_SPAN_FACTOR);

        let tip_y = y(THUMB_TIP);
        let thumb_up = tip_y + lift * TIP_TO_IP_LIFT < y(THUMB_IP)
            && tip_y + lift * TIP_TO_MCP_LIFT < y(THUMB_MCP)
            && tip_y + lift < y(WRIST);

        let thumb_vertical =
            (tip_y - y(THUMB_IP)).abs() > (x(THUMB_TIP) - x(THUMB_IP)).abs() * VERTICAL_RATIO;

        let curled = FINGER_JOINTS
            .iter()
            .filter(|&&(tip, pip, mcp)| y(tip) > y(pip).min(y(mcp)) + curl * FINGER_CURL)
            .count();
        let index_suppressed = y(INDEX_TIP) > tip_y + curl * FINGER_CURL;
        let others_curled = curled >= 3 || (curled >= 2 && index_suppressed);

        Ok(thumb_up && thumb_vertical && others_curled)
    }
}
