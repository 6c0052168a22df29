//! Pattern-driven state matcher
//!
//! Each state owns a rule table. Inputs are resolved against it in three tiers:
//! exact literals (and the end-of-input sentinel) first, then regexes in
//! registration order, then the state's default rule.

// Imports
use {
	crate::Error,
	regex::{Captures, Regex},
	std::{collections::HashMap, fmt, hash::Hash},
};

/// Rule action.
///
/// Receives the matcher's context and the transition being performed, through
/// which it may inspect the input and request a restart.
pub type Action<S, C> = fn(&mut C, &mut Transition<'_, S>) -> Result<(), Error>;

/// Matcher input
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Input<'a> {
	/// A line of text
	Line(&'a str),

	/// End of input
	Eof,
}

impl<'a> Input<'a> {
	/// Returns the text of this input, if any
	#[must_use]
	pub fn as_line(&self) -> Option<&'a str> {
		match *self {
			Self::Line(line) => Some(line),
			Self::Eof => None,
		}
	}
}

/// Rule pattern
#[derive(Clone, Debug)]
pub enum Pattern {
	/// Matches an input equal to the literal
	Literal(String),

	/// Matches an input where the regex matches at the start
	Regex(Regex),

	/// Matches the end of input
	Eof,

	/// Matches anything not otherwise matched
	Default,
}

impl Pattern {
	/// Creates a literal pattern
	pub fn literal(literal: impl Into<String>) -> Self {
		Self::Literal(literal.into())
	}
}

/// Transition outcome
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransitionOutcome<S> {
	/// Moved to the rule's next state
	Advance(S),

	/// The action overrode the rule's next state
	Restart(S),
}

impl<S: Copy> TransitionOutcome<S> {
	/// Returns the state the matcher ended in
	pub fn state(&self) -> S {
		match *self {
			Self::Advance(state) | Self::Restart(state) => state,
		}
	}
}

/// Transition being performed, as seen by an action
#[derive(Debug)]
pub struct Transition<'a, S> {
	/// State the transition started from
	pub state: S,

	/// Input that triggered the transition
	pub input: Input<'a>,

	/// Captures, if the rule was a regex
	pub captures: Option<Captures<'a>>,

	/// Requested restart
	restart: Option<S>,
}

impl<'a, S: Copy + fmt::Debug> Transition<'a, S> {
	/// Returns the text of the capture group `name`, if it participated in the match
	#[must_use]
	pub fn capture(&self, name: &str) -> Option<&'a str> {
		self.captures.as_ref()?.name(name).map(|m| m.as_str())
	}

	/// Requests that the matcher move to `target` instead of the rule's next state.
	///
	/// Only a single restart may be requested per transition.
	pub fn restart(&mut self, target: S) -> Result<(), Error> {
		if let Some(first) = self.restart {
			return Err(Error::DoubleRestart {
				first:  format!("{first:?}"),
				second: format!("{target:?}"),
			});
		}

		self.restart = Some(target);
		Ok(())
	}
}

/// Rule target
struct Rule<S, C> {
	/// Next state
	next: S,

	/// Action
	action: Option<Action<S, C>>,
}

// Note: Manual impls so `C` doesn't require `Clone`/`Debug`.
impl<S: Copy, C> Clone for Rule<S, C> {
	fn clone(&self) -> Self {
		*self
	}
}

impl<S: Copy, C> Copy for Rule<S, C> {}

impl<S: fmt::Debug, C> fmt::Debug for Rule<S, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Rule")
			.field("next", &self.next)
			.field("has_action", &self.action.is_some())
			.finish()
	}
}

/// Rule table of a single state
struct StateRules<S, C> {
	/// Exact literals
	exact: HashMap<String, Rule<S, C>>,

	/// End of input
	eof: Option<Rule<S, C>>,

	/// Regexes, in registration order
	regexes: Vec<(Regex, Rule<S, C>)>,

	/// Default
	default: Option<Rule<S, C>>,
}

impl<S, C> StateRules<S, C> {
	fn new() -> Self {
		Self {
			exact:   HashMap::new(),
			eof:     None,
			regexes: vec![],
			default: None,
		}
	}
}

impl<S: fmt::Debug, C> fmt::Debug for StateRules<S, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StateRules")
			.field("exact", &self.exact)
			.field("eof", &self.eof)
			.field("regexes", &self.regexes)
			.field("default", &self.default)
			.finish()
	}
}

/// State matcher
pub struct StateMatcher<S, C> {
	/// All states
	states: HashMap<S, StateRules<S, C>>,

	/// Current state
	state: Option<S>,
}

impl<S, C> StateMatcher<S, C>
where
	S: Copy + Eq + Hash + fmt::Debug,
{
	/// Creates an empty matcher
	#[must_use]
	pub fn new() -> Self {
		Self {
			states: HashMap::new(),
			state:  None,
		}
	}

	/// Adds a rule to `state`, creating the state if it doesn't exist.
	///
	/// Adding a literal, end-of-input or default rule that already exists replaces it.
	pub fn add(&mut self, state: S, pattern: Pattern, next: S, action: Option<Action<S, C>>) {
		let rules = self.states.entry(state).or_insert_with(StateRules::new);
		let rule = Rule { next, action };

		let prev = match pattern {
			Pattern::Literal(literal) => rules.exact.insert(literal, rule),
			Pattern::Regex(regex) => {
				rules.regexes.push((regex, rule));
				None
			},
			Pattern::Eof => rules.eof.replace(rule),
			Pattern::Default => rules.default.replace(rule),
		};

		if let Some(prev) = prev {
			tracing::warn!(?state, ?prev, ?rule, "Replaced existing rule");
		}
	}

	/// Removes `state` and all of its rules.
	///
	/// Returns if the state existed.
	pub fn del_state(&mut self, state: S) -> bool {
		self.states.remove(&state).is_some()
	}

	/// Returns if `state` has a rule table
	#[must_use]
	pub fn has_state(&self, state: S) -> bool {
		self.states.contains_key(&state)
	}

	/// Sets the current state
	pub fn start(&mut self, state: S) {
		self.state = Some(state);
	}

	/// Returns the current state
	#[must_use]
	pub fn state(&self) -> Option<S> {
		self.state
	}

	/// Executes a single transition on `input`.
	///
	/// If the rule's action fails, the current state is left unchanged.
	pub fn execute(&mut self, ctx: &mut C, input: Input<'_>) -> Result<TransitionOutcome<S>, Error> {
		let state = self.state.ok_or_else(|| Error::NoSuchState {
			state: "<not started>".to_owned(),
		})?;
		let rules = self.states.get(&state).ok_or_else(|| Error::NoSuchState {
			state: format!("{state:?}"),
		})?;

		let (rule, captures) = match self::find_rule(rules, input) {
			Some(found) => found,
			None =>
				return Err(Error::UnmatchedInput {
					state: format!("{state:?}"),
					input: input.as_line().unwrap_or("<eof>").to_owned(),
				}),
		};

		let mut transition = Transition {
			state,
			input,
			captures,
			restart: None,
		};
		if let Some(action) = rule.action {
			action(ctx, &mut transition)?;
		}

		let outcome = match transition.restart {
			Some(target) => TransitionOutcome::Restart(target),
			None => TransitionOutcome::Advance(rule.next),
		};
		tracing::trace!(?state, ?input, ?outcome, "Transition");

		self.state = Some(outcome.state());
		Ok(outcome)
	}
}

impl<S, C> Default for StateMatcher<S, C>
where
	S: Copy + Eq + Hash + fmt::Debug,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<S: fmt::Debug, C> fmt::Debug for StateMatcher<S, C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StateMatcher")
			.field("states", &self.states)
			.field("state", &self.state)
			.finish()
	}
}

/// Finds the rule for `input` in `rules`
fn find_rule<'a, S: Copy, C>(
	rules: &StateRules<S, C>,
	input: Input<'a>,
) -> Option<(Rule<S, C>, Option<Captures<'a>>)> {
	let exact = match input {
		Input::Line(line) => rules.exact.get(line),
		Input::Eof => rules.eof.as_ref(),
	};
	if let Some(&rule) = exact {
		return Some((rule, None));
	}

	if let Input::Line(line) = input {
		// Note: The leftmost match starts at 0 whenever any match does.
		let regex_match = rules.regexes.iter().find_map(|(regex, rule)| {
			let captures = regex.captures(line)?;
			(captures.get(0)?.start() == 0).then_some((*rule, Some(captures)))
		});
		if regex_match.is_some() {
			return regex_match;
		}
	}

	rules.default.map(|rule| (rule, None))
}

#[cfg(test)]
mod tests {
	use {
		super::{Input, Pattern, StateMatcher, Transition, TransitionOutcome},
		crate::Error,
		regex::Regex,
	};

	#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
	enum State {
		Scan,
		Other,
		Done,
	}

	type Log = Vec<&'static str>;

	fn do_help(log: &mut Log, _: &mut Transition<'_, State>) -> Result<(), Error> {
		log.push("doHelp");
		Ok(())
	}

	fn do_faq(log: &mut Log, _: &mut Transition<'_, State>) -> Result<(), Error> {
		log.push("doFaq");
		Ok(())
	}

	fn noop(log: &mut Log, _: &mut Transition<'_, State>) -> Result<(), Error> {
		log.push("noop");
		Ok(())
	}

	fn cleanup(log: &mut Log, _: &mut Transition<'_, State>) -> Result<(), Error> {
		log.push("cleanup");
		Ok(())
	}

	fn restart_other(_: &mut Log, transition: &mut Transition<'_, State>) -> Result<(), Error> {
		transition.restart(State::Other)
	}

	fn restart_twice(_: &mut Log, transition: &mut Transition<'_, State>) -> Result<(), Error> {
		transition.restart(State::Other)?;
		transition.restart(State::Done)
	}

	fn help_matcher() -> StateMatcher<State, Log> {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(
			State::Scan,
			Pattern::Regex(Regex::new("(?i)help").unwrap()),
			State::Scan,
			Some(do_help),
		);
		matcher.add(State::Scan, Pattern::literal("faq"), State::Scan, Some(do_faq));
		matcher.add(State::Scan, Pattern::Default, State::Scan, Some(noop));
		matcher.add(State::Scan, Pattern::Eof, State::Done, Some(cleanup));
		matcher.start(State::Scan);
		matcher
	}

	#[test]
	fn help_faq_default_eof() {
		let mut matcher = help_matcher();
		let mut log = vec![];

		for input in [Input::Line("HELP"), Input::Line("faq"), Input::Line("xyz"), Input::Eof] {
			matcher.execute(&mut log, input).unwrap();
		}

		assert_eq!(log, ["doHelp", "doFaq", "noop", "cleanup"]);
		assert_eq!(matcher.state(), Some(State::Done));
	}

	#[test]
	fn exact_before_regex() {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(
			State::Scan,
			Pattern::Regex(Regex::new("f.*").unwrap()),
			State::Other,
			Some(noop),
		);
		matcher.add(State::Scan, Pattern::literal("faq"), State::Scan, Some(do_faq));
		matcher.start(State::Scan);

		let mut log = vec![];
		let outcome = matcher.execute(&mut log, Input::Line("faq")).unwrap();
		assert_eq!(outcome, TransitionOutcome::Advance(State::Scan));
		assert_eq!(log, ["doFaq"]);

		let outcome = matcher.execute(&mut log, Input::Line("foo")).unwrap();
		assert_eq!(outcome, TransitionOutcome::Advance(State::Other));
		assert_eq!(log, ["doFaq", "noop"]);
	}

	#[test]
	fn regex_anchored_at_start() {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(State::Scan, Pattern::Regex(Regex::new("help").unwrap()), State::Done, None);
		matcher.start(State::Scan);

		let mut log = vec![];
		assert!(matches!(
			matcher.execute(&mut log, Input::Line("no help")),
			Err(Error::UnmatchedInput { .. })
		));
		assert_eq!(matcher.state(), Some(State::Scan));

		assert_eq!(
			matcher.execute(&mut log, Input::Line("help me")).unwrap(),
			TransitionOutcome::Advance(State::Done)
		);
	}

	#[test]
	fn regexes_in_registration_order() {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(State::Scan, Pattern::Regex(Regex::new("a+").unwrap()), State::Other, None);
		matcher.add(State::Scan, Pattern::Regex(Regex::new("a").unwrap()), State::Done, None);
		matcher.start(State::Scan);

		assert_eq!(
			matcher.execute(&mut vec![], Input::Line("aaa")).unwrap(),
			TransitionOutcome::Advance(State::Other)
		);
	}

	#[test]
	fn restart_overrides_next() {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(State::Scan, Pattern::Default, State::Done, Some(restart_other));
		matcher.start(State::Scan);

		let outcome = matcher.execute(&mut vec![], Input::Line("anything")).unwrap();
		assert_eq!(outcome, TransitionOutcome::Restart(State::Other));
		assert_eq!(matcher.state(), Some(State::Other));
	}

	#[test]
	fn double_restart_is_reported() {
		let mut matcher = StateMatcher::<State, Log>::new();
		matcher.add(State::Scan, Pattern::Default, State::Done, Some(restart_twice));
		matcher.start(State::Scan);

		assert!(matches!(
			matcher.execute(&mut vec![], Input::Line("anything")),
			Err(Error::DoubleRestart { .. })
		));
		assert_eq!(matcher.state(), Some(State::Scan));
	}

	#[test]
	fn unknown_state() {
		let mut matcher = help_matcher();
		matcher.start(State::Other);
		assert!(matches!(
			matcher.execute(&mut vec![], Input::Line("help")),
			Err(Error::NoSuchState { .. })
		));

		let mut matcher = StateMatcher::<State, Log>::new();
		assert!(matches!(
			matcher.execute(&mut vec![], Input::Eof),
			Err(Error::NoSuchState { .. })
		));
	}

	#[test]
	fn rebuild_state() {
		let mut matcher = help_matcher();
		assert!(matcher.del_state(State::Scan));
		assert!(!matcher.has_state(State::Scan));

		matcher.add(State::Scan, Pattern::literal("xyz"), State::Other, Some(noop));
		let mut log = vec![];
		assert!(matches!(
			matcher.execute(&mut log, Input::Line("HELP")),
			Err(Error::UnmatchedInput { .. })
		));
		assert_eq!(
			matcher.execute(&mut log, Input::Line("xyz")).unwrap(),
			TransitionOutcome::Advance(State::Other)
		);
		assert_eq!(log, ["noop"]);
	}
}
