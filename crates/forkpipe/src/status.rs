//! Bounded status lines for the user-visible narrative.
//!
//! A line is rendered into at most [`LINE_CAPACITY`] bytes and emitted with
//! a single `write(2)`, so lines from the three processes never interleave
//! mid-line. Template conversions:
//!
//! | conversion | argument | output |
//! |---|---|---|
//! | `%s` | [`Arg::Str`] | the string, whole or not at all |
//! | `%c` | [`Arg::Char`] | the character |
//! | `%d` | [`Arg::Int`] | decimal integer |
//! | `%a` | [`Arg::Ints`] | `a, b, c` |
//! | `%e` | none | bold red highlight |
//! | `%r` | none | style reset |
//!
//! Anything else, including a missing or mismatched argument, renders
//! `%% BAD FORMAT %%`. Output that does not fit is dropped, never overflowed.

use std::io;
use std::os::fd::BorrowedFd;

pub const LINE_CAPACITY: usize = 1024;

const INT_HEADROOM: usize = 12;
const BAD_FORMAT: &str = "%% BAD FORMAT %%";
const ERROR_STYLE: &str = "\x1b[1;31m";
const RESET_STYLE: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Str(&'a str),
    Char(char),
    Int(i32),
    Ints(&'a [i32]),
}

#[derive(Debug, Clone, Copy)]
pub enum Sink<'a> {
    Stdout,
    Stderr,
    Fd(BorrowedFd<'a>),
}

struct Line {
    text: String,
    capacity: usize,
    styled: bool,
}

impl Line {
    fn new(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
            styled: false,
        }
    }

    fn push_str(&mut self, s: &str) {
        if self.text.len() + s.len() < self.capacity {
            self.text.push_str(s);
        }
    }

    fn push_char(&mut self, c: char) {
        if self.text.len() + c.len_utf8() < self.capacity {
            self.text.push(c);
        }
    }

    fn push_int(&mut self, n: i32) {
        if self.text.len() + INT_HEADROOM < self.capacity {
            self.text.push_str(&n.to_string());
        }
    }

    fn push_ints(&mut self, values: &[i32]) {
        for (i, &value) in values.iter().enumerate() {
            self.push_int(value);
            if i + 1 != values.len() {
                self.push_str(", ");
            }
        }
    }

    fn push_style(&mut self, style: &str) {
        self.styled = true;
        self.push_str(style);
    }

    fn finish(mut self) -> String {
        if self.styled {
            self.push_str(RESET_STYLE);
        }
        self.text
    }
}

/// Renders `template` into a line of at most `LINE_CAPACITY - 1` bytes.
pub fn render(template: &str, args: &[Arg<'_>]) -> String {
    render_bounded(template, args, LINE_CAPACITY)
}

fn render_bounded(template: &str, args: &[Arg<'_>], capacity: usize) -> String {
    let mut line = Line::new(capacity);
    let mut args = args.iter();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            line.push_char(c);
            continue;
        }
        match chars.next() {
            Some('e') => line.push_style(ERROR_STYLE),
            Some('r') => line.push_style(RESET_STYLE),
            Some(conversion) => match (conversion, args.next()) {
                ('s', Some(Arg::Str(s))) => line.push_str(s),
                ('c', Some(Arg::Char(c))) => line.push_char(*c),
                ('d', Some(Arg::Int(n))) => line.push_int(*n),
                ('a', Some(Arg::Ints(values))) => line.push_ints(values),
                _ => line.push_str(BAD_FORMAT),
            },
            None => line.push_str(BAD_FORMAT),
        }
    }

    line.finish()
}

/// Renders and writes one line. Write errors are ignored: a status line
/// must never turn into a failure of its own.
pub fn emit(sink: Sink<'_>, template: &str, args: &[Arg<'_>]) {
    let line = render(template, args);
    let bytes = line.as_bytes();
    let _ = match sink {
        Sink::Stdout => nix::unistd::write(io::stdout(), bytes),
        Sink::Stderr => nix::unistd::write(io::stderr(), bytes),
        Sink::Fd(fd) => nix::unistd::write(fd, bytes),
    };
}

pub fn out(template: &str, args: &[Arg<'_>]) {
    emit(Sink::Stdout, template, args);
}

pub fn err(template: &str, args: &[Arg<'_>]) {
    emit(Sink::Stderr, template, args);
}
