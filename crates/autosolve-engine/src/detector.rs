use autosolve_core::Language;

/// Guesses a language from source text. Rules run in a fixed order and the
/// first hit wins; nothing is parsed or executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageDetector {
    default: Language,
}

impl LanguageDetector {
    pub fn new(default: Language) -> Self {
        Self { default }
    }

    pub fn default_language(&self) -> Language {
        self.default
    }

    pub fn detect(&self, source: &str) -> Language {
        if let Some(language) = detect_shebang(source) {
            return language;
        }

        if source.contains("<?php") {
            return Language::Php;
        }

        if source.contains("package main") {
            return Language::Go;
        }

        if source.contains("#include") {
            return match is_cpp(source) {
                true => Language::Cpp,
                false => Language::C,
            };
        }

        if source.contains("fn main") || source.contains("use std::") {
            return Language::Rust;
        }

        if lines_start_with(source, &["import ", "from ", "def "]) || source.contains("print(") {
            return Language::Python;
        }

        if source.contains("console.log")
            || source.contains("require(")
            || lines_start_with(source, &["function ", "const ", "let "])
        {
            return Language::JavaScript;
        }

        if lines_start_with(source, &["puts ", "require '", "require \""]) {
            return Language::Ruby;
        }

        if lines_start_with(source, &["echo "]) {
            return Language::Bash;
        }

        self.default
    }
}

fn detect_shebang(source: &str) -> Option<Language> {
    let first = source.lines().next()?.trim();
    let interpreter = first.strip_prefix("#!")?;
    let language = match interpreter {
        i if i.contains("python") => Language::Python,
        i if i.contains("node") => Language::JavaScript,
        i if i.contains("php") => Language::Php,
        i if i.contains("ruby") => Language::Ruby,
        i if i.ends_with("sh") || i.contains("bash") => Language::Bash,
        _ => return None,
    };
    Some(language)
}

fn is_cpp(source: &str) -> bool {
    ["<iostream>", "std::", "using namespace", "<vector>", "<string>", "cout"]
        .iter()
        .any(|marker| source.contains(marker))
}

fn lines_start_with(source: &str, prefixes: &[&str]) -> bool {
    source
        .lines()
        .map(str::trim_start)
        .any(|line| prefixes.iter().any(|p| line.starts_with(p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(source: &str) -> Language {
        LanguageDetector::default().detect(source)
    }

    #[test]
    fn test_shebang_wins() {
        assert_eq!(detect("#!/bin/bash\nimport x"), Language::Bash);
        assert_eq!(detect("#!/usr/bin/env python3\necho hi"), Language::Python);
        assert_eq!(detect("#!/usr/bin/env node\n"), Language::JavaScript);
    }

    #[test]
    fn test_go_before_python_imports() {
        let src = "package main\n\nimport \"fmt\"\n\nfunc main() { fmt.Println(\"x\") }";
        assert_eq!(detect(src), Language::Go);
    }

    #[test]
    fn test_c_vs_cpp() {
        assert_eq!(
            detect("#include <stdio.h>\nint main(){puts(\"x\");}"),
            Language::C
        );
        assert_eq!(
            detect("#include <iostream>\nint main(){std::cout<<1;}"),
            Language::Cpp
        );
    }

    #[test]
    fn test_rust() {
        assert_eq!(detect("fn main() {\n    println!(\"hi\");\n}"), Language::Rust);
    }

    #[test]
    fn test_python_and_javascript() {
        assert_eq!(detect("print(\"flag{abc123}\")"), Language::Python);
        assert_eq!(detect("import base64\nx = 1"), Language::Python);
        assert_eq!(detect("const x = 1;\nconsole.log(x);"), Language::JavaScript);
    }

    #[test]
    fn test_ruby_bash_php() {
        assert_eq!(detect("puts 'hi'"), Language::Ruby);
        assert_eq!(detect("echo hello"), Language::Bash);
        assert_eq!(detect("<?php echo 'x'; ?>"), Language::Php);
    }

    #[test]
    fn test_fallback_to_configured_default() {
        let detector = LanguageDetector::new(Language::Ruby);
        assert_eq!(detector.detect("???"), Language::Ruby);
        assert_eq!(detector.detect(""), Language::Ruby);
    }

    #[test]
    fn test_deterministic() {
        let src = "let x = 1\nputs x";
        assert_eq!(detect(src), detect(src));
    }
}
