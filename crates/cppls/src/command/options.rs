//! A small driver option table and command-line tokenizer.
//!
//! Only the options the database has to understand are declared: the ones
//! it must strip, rewrite, or locate (include directories, the input file).
//! Everything else rides along verbatim. Dash-dash parsing and grouped
//! short options are disabled, matching how compile databases spell
//! commands in practice.

/// How an option consumes its value(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// `-c`
    Flag,
    /// `-std=c++20`, `-DFOO`
    Joined,
    /// `-o out.o`, `-Xclang <arg>`
    Separate,
    /// `-I dir` or `-Idir`
    JoinedOrSeparate,
    /// `-Wl,a,b`
    CommaJoined,
    /// Fixed number of separate values.
    MultiArg(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionId {
    /// Positional input file.
    Input,
    /// A dash option with no table entry, kept verbatim.
    Unknown,
    C,
    O,
    OutputEq,
    X,
    LanguageEq,
    Std,
    Define,
    Undef,
    IncludeDir,
    Isystem,
    Iquote,
    Idirafter,
    Isysroot,
    SysrootEq,
    IncludeFile,
    Imacros,
    IncludePch,
    EmitPch,
    Xclang,
    Warning,
    NoWarnings,
    FTimeTrace,
    FTimeTraceEq,
    FTimeTraceGranularity,
    FTimeTraceVerbose,
    FTimeReport,
    FTimeReportEq,
    ModuleFileEq,
    ModuleOutput,
    ModuleOutputEq,
    PrebuiltModulePathEq,
    FFlag,
    MFlag,
    GFlag,
    OptLevel,
    Target,
    TargetEq,
    Arch,
    NoStdInc,
    NoStdLibInc,
    NoStdIncXX,
    ResourceDir,
    ResourceDirEq,
    DepFile,
    DepTarget,
    DepQuoted,
    DepFlag,
    SlashYu,
    SlashFI,
    SlashFp,
    SlashFo,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub id: OptionId,
    pub spelling: &'static str,
    pub arity: Arity,
}

const fn def(id: OptionId, spelling: &'static str, arity: Arity) -> OptionDef {
    OptionDef { id, spelling, arity }
}

/// The static option table. Longest matching spelling wins, so the generic
/// `-f`/`-m`/`-W` joined entries only catch what the specific rows above
/// them do not.
pub static OPTION_TABLE: &[OptionDef] = &[
    def(OptionId::C, "-c", Arity::Flag),
    def(OptionId::O, "-o", Arity::JoinedOrSeparate),
    def(OptionId::OutputEq, "--output=", Arity::Joined),
    def(OptionId::OutputEq, "--output", Arity::Separate),
    def(OptionId::X, "-x", Arity::JoinedOrSeparate),
    def(OptionId::LanguageEq, "--language=", Arity::Joined),
    def(OptionId::Std, "-std=", Arity::Joined),
    def(OptionId::Std, "--std=", Arity::Joined),
    def(OptionId::Define, "-D", Arity::JoinedOrSeparate),
    def(OptionId::Undef, "-U", Arity::JoinedOrSeparate),
    def(OptionId::IncludeDir, "-I", Arity::JoinedOrSeparate),
    def(OptionId::Isystem, "-isystem", Arity::JoinedOrSeparate),
    def(OptionId::Iquote, "-iquote", Arity::JoinedOrSeparate),
    def(OptionId::Idirafter, "-idirafter", Arity::JoinedOrSeparate),
    def(OptionId::Isysroot, "-isysroot", Arity::JoinedOrSeparate),
    def(OptionId::SysrootEq, "--sysroot=", Arity::Joined),
    def(OptionId::IncludePch, "-include-pch", Arity::Separate),
    def(OptionId::IncludeFile, "-include", Arity::Separate),
    def(OptionId::Imacros, "-imacros", Arity::Separate),
    def(OptionId::EmitPch, "-emit-pch", Arity::Flag),
    def(OptionId::Xclang, "-Xclang", Arity::Separate),
    def(OptionId::NoWarnings, "-w", Arity::Flag),
    def(OptionId::FTimeTraceEq, "-ftime-trace=", Arity::Joined),
    def(OptionId::FTimeTrace, "-ftime-trace", Arity::Flag),
    def(OptionId::FTimeTraceGranularity, "-ftime-trace-granularity=", Arity::Joined),
    def(OptionId::FTimeTraceVerbose, "-ftime-trace-verbose", Arity::Flag),
    def(OptionId::FTimeReportEq, "-ftime-report=", Arity::Joined),
    def(OptionId::FTimeReport, "-ftime-report", Arity::Flag),
    def(OptionId::ModuleFileEq, "-fmodule-file=", Arity::Joined),
    def(OptionId::ModuleOutputEq, "-fmodule-output=", Arity::Joined),
    def(OptionId::ModuleOutput, "-fmodule-output", Arity::Flag),
    def(OptionId::PrebuiltModulePathEq, "-fprebuilt-module-path=", Arity::Joined),
    def(OptionId::Target, "-target", Arity::Separate),
    def(OptionId::TargetEq, "--target=", Arity::Joined),
    def(OptionId::Arch, "-arch", Arity::Separate),
    def(OptionId::NoStdInc, "-nostdinc", Arity::Flag),
    def(OptionId::NoStdIncXX, "-nostdinc++", Arity::Flag),
    def(OptionId::NoStdLibInc, "-nostdlibinc", Arity::Flag),
    def(OptionId::ResourceDirEq, "-resource-dir=", Arity::Joined),
    def(OptionId::ResourceDir, "-resource-dir", Arity::Separate),
    def(OptionId::DepFile, "-MF", Arity::JoinedOrSeparate),
    def(OptionId::DepTarget, "-MT", Arity::JoinedOrSeparate),
    def(OptionId::DepQuoted, "-MQ", Arity::JoinedOrSeparate),
    def(OptionId::DepFlag, "-MMD", Arity::Flag),
    def(OptionId::DepFlag, "-MD", Arity::Flag),
    def(OptionId::DepFlag, "-MM", Arity::Flag),
    def(OptionId::DepFlag, "-MP", Arity::Flag),
    def(OptionId::DepFlag, "-M", Arity::Flag),
    def(OptionId::Warning, "-W", Arity::Joined),
    def(OptionId::FFlag, "-f", Arity::Joined),
    def(OptionId::MFlag, "-m", Arity::Joined),
    def(OptionId::GFlag, "-g", Arity::Joined),
    def(OptionId::OptLevel, "-O", Arity::Joined),
    def(OptionId::SlashYu, "/Yu", Arity::Joined),
    def(OptionId::SlashFI, "/FI", Arity::Joined),
    def(OptionId::SlashFp, "/Fp", Arity::Joined),
    def(OptionId::SlashFo, "/Fo", Arity::Joined),
];

/// One parsed argument: the matched option (if any) and its values.
#[derive(Debug, Clone)]
pub struct ParsedArg {
    pub id: OptionId,
    pub spelling: String,
    pub values: Vec<String>,
    /// How the value was attached in the original spelling, so `render`
    /// can reproduce the canonical form.
    pub joined: bool,
}

impl ParsedArg {
    fn input(text: &str) -> Self {
        Self { id: OptionId::Input, spelling: text.to_owned(), values: Vec::new(), joined: false }
    }

    fn unknown(text: &str) -> Self {
        Self { id: OptionId::Unknown, spelling: text.to_owned(), values: Vec::new(), joined: false }
    }

    /// Canonical single-string form, used for rule matching: spelling with
    /// all values joined directly.
    pub fn joined_form(&self) -> String {
        let mut out = self.spelling.clone();
        for value in &self.values {
            out.push_str(value);
        }
        out
    }

    /// Re-emit the argument as canonical tokens.
    pub fn render(&self, out: &mut Vec<String>) {
        match self.id {
            OptionId::Input | OptionId::Unknown => out.push(self.spelling.clone()),
            _ if self.joined => {
                let mut first = self.spelling.clone();
                if let Some(value) = self.values.first() {
                    first.push_str(value);
                }
                out.push(first);
                out.extend(self.values.iter().skip(1).cloned());
            }
            _ => {
                out.push(self.spelling.clone());
                out.extend(self.values.iter().cloned());
            }
        }
    }
}

/// Tokenize a GNU-style command string: whitespace separated, single and
/// double quotes, backslash escapes outside single quotes.
pub fn tokenize_command(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut pending = false;
    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if pending {
                    out.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            '\'' => {
                pending = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '"' => {
                pending = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if matches!(next, '"' | '\\' | '$' | '`') {
                                    current.push(next);
                                    chars.next();
                                } else {
                                    current.push('\\');
                                }
                            }
                        }
                        _ => current.push(inner),
                    }
                }
            }
            '\\' => {
                pending = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            _ => {
                pending = true;
                current.push(ch);
            }
        }
    }
    if pending {
        out.push(current);
    }
    out
}

/// Parse a token stream against the option table.
///
/// Tokens that do not start with `-` or `/` are positional inputs. Dash
/// tokens with no table entry are kept verbatim as [`OptionId::Unknown`];
/// a later filter decides what to do with them. A malformed trailing
/// option (arity demands a value that is not there) yields the option with
/// the values it managed to collect.
pub fn parse_arguments(tokens: &[String]) -> Vec<ParsedArg> {
    let mut out = Vec::new();
    let mut index = 0usize;
    while index < tokens.len() {
        let token = &tokens[index];
        index += 1;
        if !token.starts_with('-') && !token.starts_with('/') {
            out.push(ParsedArg::input(token));
            continue;
        }
        let Some((def, joined, value)) = match_option(token) else {
            // A slash token with no table entry is a path, not an MSVC
            // option.
            if token.starts_with('/') {
                out.push(ParsedArg::input(token));
            } else {
                out.push(ParsedArg::unknown(token));
            }
            continue;
        };
        let mut arg = ParsedArg {
            id: def.id,
            spelling: def.spelling.to_owned(),
            values: Vec::new(),
            joined,
        };
        match def.arity {
            Arity::Flag => {}
            Arity::Joined => arg.values.push(value),
            Arity::CommaJoined => {
                arg.values.extend(value.split(',').map(str::to_owned));
            }
            Arity::Separate => {
                if index < tokens.len() {
                    arg.values.push(tokens[index].clone());
                    index += 1;
                }
            }
            Arity::JoinedOrSeparate => {
                if joined {
                    arg.values.push(value);
                } else if index < tokens.len() {
                    arg.values.push(tokens[index].clone());
                    index += 1;
                }
            }
            Arity::MultiArg(n) => {
                for _ in 0..n {
                    if index < tokens.len() {
                        arg.values.push(tokens[index].clone());
                        index += 1;
                    }
                }
            }
        }
        out.push(arg);
    }
    out
}

/// Find the longest table entry matching `token`. Returns the definition,
/// whether the value was joined on, and the joined value (empty otherwise).
fn match_option(token: &str) -> Option<(&'static OptionDef, bool, String)> {
    let mut best: Option<(&'static OptionDef, bool, String)> = None;
    for def in OPTION_TABLE {
        let candidate = match def.arity {
            Arity::Flag | Arity::Separate | Arity::MultiArg(_) => {
                if token == def.spelling {
                    Some((def, false, String::new()))
                } else {
                    None
                }
            }
            Arity::Joined | Arity::CommaJoined => token
                .strip_prefix(def.spelling)
                .map(|rest| (def, true, rest.to_owned())),
            Arity::JoinedOrSeparate => {
                if token == def.spelling {
                    Some((def, false, String::new()))
                } else {
                    token.strip_prefix(def.spelling).map(|rest| (def, true, rest.to_owned()))
                }
            }
        };
        if let Some(candidate) = candidate {
            let better = match &best {
                None => true,
                Some((current, _, _)) => def.spelling.len() > current.spelling.len(),
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}
