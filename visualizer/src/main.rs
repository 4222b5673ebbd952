use iced::{
    mouse, time,
    widget::{
        button,
        canvas::{self, Canvas, Frame, Geometry, Path, Stroke},
        column, row, scrollable, text, text_input, Column, Container,
    },
    Alignment, Color, Element, Length, Point, Rectangle, Renderer, Subscription, Task, Theme,
};
use pedalcore::pairing::SessionCode;
use pedalcore::{RidePhase, RideSnapshot};
use std::time::Duration;

const RELAY_URL: &str = "http://127.0.0.1:9000";
const HISTORY_SAMPLES: usize = 180;

fn main() -> iced::Result {
    iced::application(Viewer::boot, Viewer::update, Viewer::view)
        .title(application_title)
        .subscription(application_subscription)
        .theme(application_theme)
        .run()
}

fn application_title(state: &Viewer) -> String {
    match &state.code {
        Some(code) => format!("PedalSight Second Screen - {}", code),
        None => "PedalSight Second Screen".into(),
    }
}

fn application_subscription(state: &Viewer) -> Subscription<Message> {
    if state.code.is_some() {
        time::every(Duration::from_secs(1)).map(|_| Message::Tick)
    } else {
        Subscription::none()
    }
}

fn application_theme(_: &Viewer) -> Theme {
    Theme::Dark
}

#[derive(Debug)]
struct Viewer {
    code_input: String,
    code: Option<SessionCode>,
    snapshot: Option<RideSnapshot>,
    velocity_history: Vec<f32>,
    status: String,
    history: Vec<String>,
}

#[derive(Debug, Clone)]
enum Message {
    Tick,
    StateFetched(Result<Option<RideSnapshot>, String>),
    CodeChanged(String),
    Watch,
    ClearCode,
}

impl Viewer {
    fn boot() -> (Self, Task<Message>) {
        (
            Viewer {
                code_input: String::new(),
                code: None,
                snapshot: None,
                velocity_history: Vec::new(),
                status: "Enter the code shown on the riding screen.".into(),
                history: Vec::new(),
            },
            Task::none(),
        )
    }

    fn update(state: &mut Self, message: Message) -> Task<Message> {
        match message {
            Message::Tick => match &state.code {
                Some(code) => Task::perform(fetch_state(code.clone()), Message::StateFetched),
                None => Task::none(),
            },
            Message::StateFetched(Ok(Some(snapshot))) => {
                if state.snapshot.as_ref().map(|previous| previous.phase) != Some(snapshot.phase) {
                    state.push_history(format!("Ride is now {}", phase_label(snapshot.phase)));
                }
                if snapshot.phase == RidePhase::Riding {
                    push_sample(&mut state.velocity_history, snapshot.velocity_kmh);
                }
                state.status = "Mirroring ride".into();
                state.snapshot = Some(snapshot);
                Task::none()
            }
            Message::StateFetched(Ok(None)) => {
                state.status = "Waiting for the riding screen to publish...".into();
                Task::none()
            }
            Message::StateFetched(Err(err)) => {
                state.status = format!("Relay error: {err}");
                Task::none()
            }
            Message::CodeChanged(value) => {
                state.code_input = value;
                Task::none()
            }
            Message::Watch => match SessionCode::parse(&state.code_input) {
                Ok(code) => {
                    state.push_history(format!("Watching {}", code));
                    state.snapshot = None;
                    state.velocity_history.clear();
                    state.code = Some(code.clone());
                    Task::perform(fetch_state(code), Message::StateFetched)
                }
                Err(err) => {
                    state.status = err.to_string();
                    Task::none()
                }
            },
            Message::ClearCode => {
                if let Some(code) = state.code.take() {
                    state.push_history(format!("Stopped watching {}", code));
                }
                state.status = "Enter the code shown on the riding screen.".into();
                Task::none()
            }
        }
    }

    fn view(state: &Self) -> Element<'_, Message> {
        let code_column = column![
            text("Display code").size(26),
            text_input("6-digit code", &state.code_input)
                .on_input(Message::CodeChanged)
                .on_submit(Message::Watch)
                .padding(6),
            row![
                button("Watch").on_press(Message::Watch).padding(10),
                button("Clear").on_press(Message::ClearCode).padding(10),
            ]
            .spacing(10),
            text(&state.status).size(14),
            text("Activity log").size(16),
            Container::new(scrollable(history_list(&state.history)).height(Length::Fixed(220.0)))
                .padding(6),
        ]
        .spacing(10)
        .padding(16)
        .width(Length::Fixed(320.0));

        let readouts = match &state.snapshot {
            Some(snapshot) => readout_column(snapshot),
            None => Column::new().push(text("No ride data yet").size(18)),
        };

        let history = Canvas::new(VelocityHistory {
            samples: state.velocity_history.clone(),
        })
        .width(Length::Fill)
        .height(Length::Fixed(240.0));

        let ride_column = column![
            text("Ride").size(26),
            readouts,
            text("Velocity history (km/h)").size(16),
            history,
        ]
        .spacing(10)
        .padding(16)
        .width(Length::Fill);

        let layout = row![code_column, ride_column]
            .spacing(20)
            .align_y(Alignment::Start)
            .padding(20);

        Container::new(layout)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn push_history(&mut self, entry: String) {
        self.history.push(entry);
        if self.history.len() > 20 {
            self.history.remove(0);
        }
    }
}

fn history_list(history: &[String]) -> Column<'_, Message> {
    if history.is_empty() {
        Column::new().push(text("No activity yet").size(12))
    } else {
        history
            .iter()
            .rev()
            .fold(Column::new().spacing(4), |col, entry| {
                col.push(text(entry.clone()).size(12))
            })
    }
}

fn readout_column(snapshot: &RideSnapshot) -> Column<'static, Message> {
    let mut readouts = Column::new().spacing(6).push(
        text(format!("Phase: {}", phase_label(snapshot.phase))).size(20),
    );
    if snapshot.phase == RidePhase::Wizard {
        readouts = readouts.push(text(format!("Setup step {}", snapshot.step)).size(16));
    }
    readouts
        .push(text(format!("{:.1} km/h", snapshot.velocity_kmh)).size(48))
        .push(text(format!("{:.0} rpm", snapshot.rpm)).size(32))
        .push(text(format!("Distance {:.2} km", snapshot.distance_km)).size(18))
        .push(text(format!("Time {}", format_elapsed(snapshot.elapsed_ms))).size(18))
        .push(text(format!("Gear {}", snapshot.gear)).size(18))
        .push(text(format!("Max {:.1} km/h", snapshot.max_velocity_kmh)).size(18))
}

fn phase_label(phase: RidePhase) -> &'static str {
    match phase {
        RidePhase::Wizard => "setting up",
        RidePhase::Riding => "riding",
        RidePhase::Paused => "paused",
        RidePhase::Finished => "finished",
    }
}

fn format_elapsed(elapsed_ms: u64) -> String {
    let total_secs = elapsed_ms / 1_000;
    let (hours, minutes, seconds) = (total_secs / 3_600, (total_secs / 60) % 60, total_secs % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

fn push_sample(samples: &mut Vec<f32>, value: f32) {
    samples.push(value);
    if samples.len() > HISTORY_SAMPLES {
        let excess = samples.len() - HISTORY_SAMPLES;
        samples.drain(..excess);
    }
}

/// `Ok(None)` while nothing has been published under `code`.
async fn fetch_state(code: SessionCode) -> Result<Option<RideSnapshot>, String> {
    let response = reqwest::get(format!("{}/state/{}", RELAY_URL, code))
        .await
        .map_err(|e| e.to_string())?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = response.error_for_status().map_err(|e| e.to_string())?;
    response
        .json::<RideSnapshot>()
        .await
        .map(Some)
        .map_err(|e| e.to_string())
}

#[derive(Clone)]
struct VelocityHistory {
    samples: Vec<f32>,
}

impl canvas::Program<Message> for VelocityHistory {
    type State = ();

    fn draw(
        &self,
        _state: &Self::State,
        renderer: &Renderer,
        _theme: &Theme,
        bounds: Rectangle,
        _cursor: mouse::Cursor,
    ) -> Vec<Geometry> {
        let mut frame = Frame::new(renderer, bounds.size());
        frame.fill_rectangle(
            Point::ORIGIN,
            bounds.size(),
            Color::from_rgb(0.05, 0.05, 0.05),
        );

        let ceiling = self
            .samples
            .iter()
            .cloned()
            .fold(30.0_f32, f32::max)
            .min(60.0);

        let grid = Path::new(|builder| {
            for step in 1..4 {
                let y = bounds.height * step as f32 / 4.0;
                builder.move_to(Point::new(0.0, y));
                builder.line_to(Point::new(bounds.width, y));
            }
        });
        frame.stroke(
            &grid,
            Stroke::default()
                .with_color(Color::from_rgb(0.2, 0.2, 0.25))
                .with_width(1.0),
        );

        if self.samples.len() > 1 {
            let step = bounds.width / (HISTORY_SAMPLES as f32 - 1.0);
            let path = Path::new(|builder| {
                for (i, value) in self.samples.iter().enumerate() {
                    let x = i as f32 * step;
                    let normalized = (value / ceiling).clamp(0.0, 1.0);
                    let y = bounds.height - normalized * bounds.height;
                    if i == 0 {
                        builder.move_to(Point::new(x, y));
                    } else {
                        builder.line_to(Point::new(x, y));
                    }
                }
            });

            frame.stroke(
                &path,
                Stroke::default()
                    .with_width(2.5)
                    .with_color(Color::from_rgb(0.18, 0.72, 0.89)),
            );
        }

        vec![frame.into_geometry()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_formatted_as_clock() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(75_400), "01:15");
        assert_eq!(format_elapsed(3_725_000), "1:02:05");
    }

    #[test]
    fn history_keeps_most_recent_samples() {
        let mut samples = Vec::new();
        for i in 0..(HISTORY_SAMPLES + 10) {
            push_sample(&mut samples, i as f32);
        }
        assert_eq!(samples.len(), HISTORY_SAMPLES);
        assert_eq!(samples[0], 10.0);
    }
}
