//! Built-in language engines.
//!
//! Templates follow format-string conventions: `{field}` is substituted when
//! the script is assembled, `{{` and `}}` are literal braces.

use super::{EngineDefinition, EngineRegistry};
use crate::error::Result;

const PYTHON_TEMPLATE: &str = r##"
# -*- coding: {encoding} -*-

{future}

import os
import sys
import codecs

if '--interactive' not in sys.argv[1:]:
    sys.stdout = codecs.getwriter('{encoding}')(sys.stdout.buffer, 'strict')
    sys.stderr = codecs.getwriter('{encoding}')(sys.stderr.buffer, 'strict')


class TexrunUtils(object):
    def __init__(self):
        self.id = None
        self.family = None
        self.session = None
        self.restart = None
        self.command = None
        self.context = dict()
        self.args = None
        self.instance = None
        self.line = None
        self.docdir = None
        self.dependencies = []
        self.created = []
        self._context_raw = None
        self.formatter = str
        self.before = lambda: None
        self.after = lambda: None

    def set_formatter(self, name='str'):
        if name == 'str':
            self.formatter = str
        elif name == 'repr':
            self.formatter = repr
        elif name == 'sympy_latex':
            from sympy import latex
            self.formatter = latex
        else:
            raise ValueError('Unsupported formatter ' + repr(name))

    def set_context(self, expr):
        if expr and expr != self._context_raw:
            pairs = (kv.split('=', 1) for kv in expr.split(','))
            self.context = dict((k.strip(), v.strip()) for k, v in pairs)
            self._context_raw = expr

    def add_dependencies(self, *files):
        self.dependencies.extend(files)

    def add_created(self, *files):
        self.created.extend(files)

    def open(self, name, mode='r', *args, **kwargs):
        if any(m in mode for m in 'wax'):
            self.add_created(name)
        else:
            self.add_dependencies(name)
        return open(name, mode, *args, **kwargs)

    def cleanup(self):
        print('{dependencies_delim}')
        for f in self.dependencies:
            print(f)
        print('{created_delim}')
        for f in self.created:
            print(f)


pytex = TexrunUtils()

pytex.docdir = os.getcwd()
if os.path.isdir('{workingdir}'):
    os.chdir('{workingdir}')
    if os.getcwd() not in sys.path:
        sys.path.append(os.getcwd())
else:
    if len(sys.argv) < 2 or sys.argv[1] != '--manual':
        sys.exit('Cannot find directory {workingdir}')
if pytex.docdir not in sys.path:
    sys.path.append(pytex.docdir)

{extend}

pytex.id = '{family}_{session}_{restart}'
pytex.family = '{family}'
pytex.session = '{session}'
pytex.restart = '{restart}'

{body}

pytex.cleanup()
"##;

const PYTHON_WRAPPER: &str = r##"
pytex.command = '{command}'
pytex.set_context('{context}')
pytex.args = '{args}'
pytex.instance = '{instance}'
pytex.line = '{line}'

print('{stdoutdelim}')
sys.stderr.write('{stderrdelim}\n')
pytex.before()

{code}

pytex.after()
"##;

const PYTHON_SUB: &str = "print('{field_delim}')\nprint({field})\n";

const RUBY_TEMPLATE: &str = r##"
# -*- coding: {encoding} -*-

unless ARGV.include?('--interactive')
    $stdout.set_encoding('{encoding}')
    $stderr.set_encoding('{encoding}')
end

class RubyTexrunUtils
    attr_accessor :id, :family, :session, :restart,
            :command, :context, :args,
            :instance, :line, :dependencies, :created,
            :docdir, :_context_raw
    def initialize
        @dependencies = Array.new
        @created = Array.new
        @_context_raw = nil
    end
    def formatter(expr)
        return expr.to_s
    end
    def before
    end
    def after
    end
    def add_dependencies(*expr)
        self.dependencies.push(*expr)
    end
    def add_created(*expr)
        self.created.push(*expr)
    end
    def set_context(expr)
        if expr != "" and expr != @_context_raw
            @context = Hash[expr.split(',').map {{ |x| x.split('=', 2).map(&:strip) }}]
            @_context_raw = expr
        end
    end
    def cleanup
        puts '{dependencies_delim}'
        @dependencies.each {{ |x| puts x }}
        puts '{created_delim}'
        @created.each {{ |x| puts x }}
    end
end

rbtex = RubyTexrunUtils.new

rbtex.docdir = Dir.pwd
if File.directory?('{workingdir}')
    Dir.chdir('{workingdir}')
    $LOAD_PATH.push(Dir.pwd) unless $LOAD_PATH.include?(Dir.pwd)
elsif ARGV[0] != '--manual'
    abort('Cannot change to directory {workingdir}')
end
$LOAD_PATH.push(rbtex.docdir) unless $LOAD_PATH.include?(rbtex.docdir)

{extend}

rbtex.id = '{family}_{session}_{restart}'
rbtex.family = '{family}'
rbtex.session = '{session}'
rbtex.restart = '{restart}'

{body}

rbtex.cleanup
"##;

const RUBY_WRAPPER: &str = r##"
rbtex.command = '{command}'
rbtex.set_context('{context}')
rbtex.args = '{args}'
rbtex.instance = '{instance}'
rbtex.line = '{line}'

puts '{stdoutdelim}'
$stderr.puts '{stderrdelim}'
rbtex.before

{code}

rbtex.after
"##;

const RUBY_SUB: &str = "puts '{field_delim}'\nputs {field}\n";

const JULIA_TEMPLATE: &str = r##"
# -*- coding: UTF-8 -*-

mutable struct JuliaTexrunUtils
    id::String
    family::String
    session::String
    restart::String
    command::String
    context::Dict{{String, String}}
    args::String
    instance::String
    line::String
    dependencies::Vector{{String}}
    created::Vector{{String}}
    docdir::String
    context_raw::String
    formatter::Function
    before::Function
    after::Function
end

JuliaTexrunUtils() = JuliaTexrunUtils("", "", "", "", "", Dict{{String, String}}(), "", "", "",
                                      String[], String[], pwd(), "", string, () -> nothing, () -> nothing)

function add_dependencies(t::JuliaTexrunUtils, files...)
    append!(t.dependencies, collect(String, files))
end

function add_created(t::JuliaTexrunUtils, files...)
    append!(t.created, collect(String, files))
end

function set_context(t::JuliaTexrunUtils, expr)
    if expr != "" && expr != t.context_raw
        t.context = Dict{{String, String}}(strip(kv[1]) => strip(kv[2]) for kv in map(x -> split(x, "=", limit=2), split(expr, ",")))
        t.context_raw = expr
    end
end

function cleanup(t::JuliaTexrunUtils)
    println("{dependencies_delim}")
    for f in t.dependencies
        println(f)
    end
    println("{created_delim}")
    for f in t.created
        println(f)
    end
end

jltex = JuliaTexrunUtils()

try
    cd("{workingdir}")
catch
    if !(length(ARGS) > 0 && ARGS[1] == "--manual")
        error("Could not find directory {workingdir}")
    end
end
if !(jltex.docdir in LOAD_PATH)
    push!(LOAD_PATH, jltex.docdir)
end

{extend}

jltex.id = "{family}_{session}_{restart}"
jltex.family = "{family}"
jltex.session = "{session}"
jltex.restart = "{restart}"

{body}

cleanup(jltex)
"##;

const JULIA_WRAPPER: &str = r##"
jltex.command = "{command}"
set_context(jltex, "{context}")
jltex.args = "{args}"
jltex.instance = "{instance}"
jltex.line = "{line}"

println("{stdoutdelim}")
write(stderr, "{stderrdelim}\n")
jltex.before()

{code}

jltex.after()
"##;

const JULIA_SUB: &str = "println(\"{field_delim}\")\nprintln({field})\n";

const OCTAVE_TEMPLATE: &str = r##"
global octavetex = struct();
octavetex.docdir = pwd();
try
    cd '{Workingdir}';
catch
    arg_list = argv();
    if size(arg_list, 1) == 1 && strcmp(arg_list{{1}}, '--manual')
    else
        error("Could not find directory {workingdir}");
    end
end
if dir_in_loadpath(octavetex.docdir)
else
    addpath(octavetex.docdir);
end

{extend}

octavetex.dependencies = {{}};
octavetex.created = {{}};
octavetex._context_raw = '';

function octavetex_add_dependencies(varargin)
    global octavetex;
    for i = 1:length(varargin)
        octavetex.dependencies{{end+1}} = varargin{{i}};
    end
end
octavetex.add_dependencies = @(varargin) octavetex_add_dependencies(varargin{{:}});

function octavetex_add_created(varargin)
    global octavetex;
    for i = 1:length(varargin)
        octavetex.created{{end+1}} = varargin{{i}};
    end
end
octavetex.add_created = @(varargin) octavetex_add_created(varargin{{:}});

function octavetex_set_context(argin)
    global octavetex;
    if ~strcmp(argin, octavetex._context_raw)
        octavetex._context_raw = argin;
        hash = struct;
        argin_kv = strsplit(argin, ',');
        for i = 1:length(argin_kv)
            kv = strsplit(argin_kv{{i}}, '=');
            hash = setfield(hash, strtrim(kv{{1}}), strtrim(kv{{2}}));
        end
        octavetex.context = hash;
    end
end
octavetex.set_context = @(argin) octavetex_set_context(argin);

function octavetex_cleanup()
    global octavetex;
    fprintf(strcat('{dependencies_delim}', "\n"));
    for i = 1:length(octavetex.dependencies)
        fprintf(strcat(octavetex.dependencies{{i}}, "\n"));
    end
    fprintf(strcat('{created_delim}', "\n"));
    for i = 1:length(octavetex.created)
        fprintf(strcat(octavetex.created{{i}}, "\n"));
    end
end

octavetex.id = '{family}_{session}_{restart}';
octavetex.family = '{family}';
octavetex.session = '{session}';
octavetex.restart = '{restart}';

{body}

octavetex_cleanup()
"##;

const OCTAVE_WRAPPER: &str = r##"
octavetex.command = '{command}';
octavetex.set_context('{context}');
octavetex.args = '{args}';
octavetex.instance = '{instance}';
octavetex.line = '{line}';

fprintf(strcat('{stdoutdelim}', "\n"));
fprintf(stderr, strcat('{stderrdelim}', "\n"));
{code}
"##;

const OCTAVE_SUB: &str = "disp(\"{field_delim}\")\ndisp({field})\n";

const BASH_TEMPLATE: &str = r##"
cd "{workingdir}"
{body}
echo "{dependencies_delim}"
echo "{created_delim}"
"##;

const BASH_WRAPPER: &str = r##"
echo "{stdoutdelim}"
>&2 echo "{stderrdelim}"
{code}
"##;

const BASH_SUB: &str = "echo \"{field_delim}\"\necho {field}\n";

const RUST_TEMPLATE: &str = r##"
// -*- coding: {encoding} -*-
#![allow(dead_code, unused_imports, unused_mut, unused_variables)]
use std::fmt::Display;
use std::io::Write;

struct RsTex {{
    id: String,
    family: String,
    session: String,
    restart: String,
    command: String,
    context: String,
    args: String,
    instance: String,
    line: String,
    dependencies: Vec<String>,
    created: Vec<String>,
}}

impl RsTex {{
    fn formatter<T: Display>(&self, val: T) -> String {{
        val.to_string()
    }}

    fn setup_wrapper(&mut self, command: &str, context: &str, args: &str, instance: &str, line: &str) {{
        self.command = command.to_string();
        self.context = context.to_string();
        self.args = args.to_string();
        self.instance = instance.to_string();
        self.line = line.to_string();
    }}

    fn add_dependencies(&mut self, files: &[&str]) {{
        self.dependencies.extend(files.iter().map(|f| f.to_string()));
    }}

    fn add_created(&mut self, files: &[&str]) {{
        self.created.extend(files.iter().map(|f| f.to_string()));
    }}

    fn cleanup(&self) {{
        println!("{dependencies_delim}");
        for f in &self.dependencies {{
            println!("{{}}", f);
        }}
        println!("{created_delim}");
        for f in &self.created {{
            println!("{{}}", f);
        }}
    }}
}}

fn main() {{
let mut rstex = RsTex {{
    id: "{family}_{session}_{restart}".to_string(),
    family: "{family}".to_string(),
    session: "{session}".to_string(),
    restart: "{restart}".to_string(),
    command: String::new(),
    context: String::new(),
    args: String::new(),
    instance: String::new(),
    line: String::new(),
    dependencies: Vec::new(),
    created: Vec::new(),
}};
if std::env::set_current_dir("{Workingdir}").is_err() {{
    eprintln!("Cannot find directory {workingdir}");
    std::process::exit(1);
}}

{extend}

{body}

rstex.cleanup();
}}
"##;

const RUST_WRAPPER: &str = r##"
rstex.setup_wrapper("{command}", "{context}", "{args}", "{instance}", "{line}");
println!("{stdoutdelim}");
eprintln!("{stderrdelim}");
{code}
"##;

const RUST_SUB: &str = "println!(\"{field_delim}\");\nprintln!(\"{{}}\", {field});\n";

/// Register every built-in engine and its subtypes.
pub(super) fn register_all(registry: &mut EngineRegistry) -> Result<()> {
    registry.register(
        EngineDefinition::builder("python", "python", ".py")
            .commands(["{python} {file}.py"])
            .template(PYTHON_TEMPLATE)
            .wrapper(PYTHON_WRAPPER)
            .formatter("print(pytex.formatter({code}))")
            .sub(PYTHON_SUB)
            .errors(["Error:"])
            .warnings(["Warning:"])
            .linenumbers(["line {number}", ":{number}:"])
            .build()?,
    );
    let py = registry.derive("python", "py")?.build()?;
    registry.register(py);
    let pylab = registry.derive("python", "pylab")?.extend("from pylab import *").build()?;
    registry.register(pylab);
    let sympy = registry
        .derive("python", "sympy")?
        .extend("from sympy import *\npytex.set_formatter('sympy_latex')\n")
        .build()?;
    registry.register(sympy);
    let sage = registry
        .derive("python", "sage")?
        .language("sage")
        .extension(".sage")
        .template(&PYTHON_TEMPLATE.replace("{future}", ""))
        .commands(["{sage} {file}.sage"])
        .extend("pytex.formatter = latex")
        .build()?;
    registry.register(sage);

    for (name, startup) in [
        ("pycon", ""),
        ("pylabcon", "from pylab import *"),
        ("sympycon", "from sympy import *"),
    ] {
        registry.register(
            EngineDefinition::builder(name, "python", "")
                .console(true)
                .startup(startup)
                .build()?,
        );
    }

    registry.register(
        EngineDefinition::builder("ruby", "ruby", ".rb")
            .commands(["{ruby} {file}.rb"])
            .template(RUBY_TEMPLATE)
            .wrapper(RUBY_WRAPPER)
            .formatter("puts rbtex.formatter({code})")
            .sub(RUBY_SUB)
            .errors(["Error)", "(Errno", "error"])
            .warnings(["warning:"])
            .linenumbers([":{number}:"])
            .build()?,
    );
    let rb = registry.derive("ruby", "rb")?.build()?;
    registry.register(rb);

    registry.register(
        EngineDefinition::builder("julia", "julia", ".jl")
            .commands(["{julia} \"{file}.jl\""])
            .template(JULIA_TEMPLATE)
            .wrapper(JULIA_WRAPPER)
            .formatter("println(jltex.formatter({code}))")
            .sub(JULIA_SUB)
            .errors(["ERROR:"])
            .warnings(["WARNING:"])
            .linenumbers([":{number}"])
            .lookbehind(true)
            .build()?,
    );
    let jl = registry.derive("julia", "jl")?.build()?;
    registry.register(jl);

    registry.register(
        EngineDefinition::builder("octave", "octave", ".m")
            .commands(["{octave} -q \"{File}.m\""])
            .template(OCTAVE_TEMPLATE)
            .wrapper(OCTAVE_WRAPPER)
            .formatter("disp({code})")
            .sub(OCTAVE_SUB)
            .errors(["error"])
            .warnings(["warning"])
            .linenumbers(["line {number}"])
            .build()?,
    );

    registry.register(
        EngineDefinition::builder("bash", "bash", ".sh")
            .commands(["{bash} \"{file}.sh\""])
            .template(BASH_TEMPLATE)
            .wrapper(BASH_WRAPPER)
            .formatter("{code}")
            .sub(BASH_SUB)
            .errors(["error", "Error"])
            .warnings(["warning", "Warning"])
            .linenumbers(["line {number}"])
            .build()?,
    );

    registry.register(
        EngineDefinition::builder("rust", "rust", ".rs")
            .commands([
                "{rustc} --crate-type bin -o {File}.exe -L {workingdir} {file}.rs",
                "{File}.exe",
            ])
            .template(RUST_TEMPLATE)
            .wrapper(RUST_WRAPPER)
            .formatter("{{ let val = {{ {code} }}; println!(\"{{}}\", rstex.formatter(val)); }}")
            .sub(RUST_SUB)
            .errors(["error:"])
            .warnings(["warning:"])
            .linenumbers([".rs:{number}"])
            .created(["{File}.exe"])
            .build()?,
    );
    let rs = registry.derive("rust", "rs")?.build()?;
    registry.register(rs);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_families_registered() {
        let registry = EngineRegistry::builtin().expect("Failed to build registry");
        for family in [
            "python", "py", "pylab", "sympy", "sage", "pycon", "pylabcon", "sympycon", "ruby", "rb",
            "julia", "jl", "octave", "bash", "rust", "rs",
        ] {
            assert!(registry.contains(family), "missing {}", family);
        }
    }

    #[test]
    fn test_subtypes_inherit_and_extend() {
        let registry = EngineRegistry::builtin().expect("Failed to build registry");
        let python = registry.get("python").expect("python");
        let sympy = registry.get("sympy").expect("sympy");
        assert_eq!(python.template, sympy.template);
        assert!(sympy.extend.contains("set_formatter('sympy_latex')"));

        let sage = registry.get("sage").expect("sage");
        assert!(!sage.is_python());
        assert!(!sage.template.contains("{future}"));
        assert_eq!(sage.extension, "sage");
    }

    #[test]
    fn test_templates_have_single_placeholders() {
        let registry = EngineRegistry::builtin().expect("Failed to build registry");
        let rust = registry.get("rs").expect("rs");
        assert_eq!(rust.template.matches("{body}").count(), 1);
        assert_eq!(rust.commands.len(), 2);
        assert_eq!(rust.created, vec!["{File}.exe".to_string()]);
        assert!(registry.get("pycon").expect("pycon").commands.is_empty());
    }
}
